//! Per-stage loop nest construction tests: split tail strategies, loop
//! metadata lets, reduction-domain guards, and specializations.

use arrayloom::ir::visit::for_each_stmt_expr;
use arrayloom::ir::{CallType, Expr, Stmt};
use arrayloom::lower::build_provide_loop_nest;
use arrayloom::producer::{Producer, ReductionDomain};
use arrayloom::schedule::TailStrategy;
use arrayloom::{Error, ScheduleBuilder};

fn collect_loop_names(s: &Stmt, out: &mut Vec<String>) {
    match s {
        Stmt::For { name, body, .. } => {
            out.push(name.clone());
            collect_loop_names(body, out);
        }
        Stmt::Let { body, .. }
        | Stmt::Realize { body, .. }
        | Stmt::ProducerConsumer { body, .. } => collect_loop_names(body, out),
        Stmt::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            collect_loop_names(then_case, out);
            if let Some(e) = else_case {
                collect_loop_names(e, out);
            }
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_loop_names(s, out);
            }
        }
        _ => {}
    }
}

fn collect_let_names(s: &Stmt, out: &mut Vec<String>) {
    match s {
        Stmt::Let { name, body, .. } => {
            out.push(name.clone());
            collect_let_names(body, out);
        }
        Stmt::For { body, .. }
        | Stmt::Realize { body, .. }
        | Stmt::ProducerConsumer { body, .. } => collect_let_names(body, out),
        Stmt::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            collect_let_names(then_case, out);
            if let Some(e) = else_case {
                collect_let_names(e, out);
            }
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_let_names(s, out);
            }
        }
        _ => {}
    }
}

fn contains_intrinsic(s: &Stmt, intrinsic: &str) -> bool {
    let mut found = false;
    for_each_stmt_expr(s, &mut |e| {
        if let Expr::Call {
            name,
            call_type: CallType::Intrinsic,
            ..
        } = e
        {
            if name == intrinsic {
                found = true;
            }
        }
    });
    found
}

fn nest_for(env_f: &Producer) -> Stmt {
    build_provide_loop_nest(
        &env_f.name,
        &format!("{}.s0.", env_f.name),
        None,
        &env_f.args,
        &env_f.init,
        false,
    )
    .expect("legal schedule")
}

#[test]
fn unscheduled_stage_produces_one_loop_per_dim() {
    let f = Producer::define("f", &["x", "y"], vec![Expr::var("x") + Expr::var("y")]);
    let nest = nest_for(&f);

    let mut loops = Vec::new();
    collect_loop_names(&nest, &mut loops);
    assert_eq!(loops, ["f.s0.__outermost", "f.s0.y", "f.s0.x"]);

    // Metadata lets bind loop bounds for each arg and the sentinel.
    let mut lets = Vec::new();
    collect_let_names(&nest, &mut lets);
    for expected in [
        "f.s0.x.loop_min",
        "f.s0.x.loop_max",
        "f.s0.x.loop_extent",
        "f.s0.y.loop_min",
        "f.s0.__outermost.loop_extent",
    ] {
        assert!(lets.iter().any(|l| l == expected), "missing let {expected}");
    }
}

#[test]
fn provide_site_and_values_are_qualified() {
    let f = Producer::define("f", &["x"], vec![Expr::var("x") * Expr::IntImm(2)]);
    let nest = nest_for(&f);

    let mut provide_seen = false;
    fn find_provide(s: &Stmt, seen: &mut bool) {
        match s {
            Stmt::Provide { name, values, args } => {
                assert_eq!(name, "f");
                assert_eq!(args[0], Expr::var("f.s0.x"));
                assert_eq!(values[0], Expr::var("f.s0.x") * Expr::IntImm(2));
                *seen = true;
            }
            Stmt::Let { body, .. } | Stmt::For { body, .. } => find_provide(body, seen),
            Stmt::IfThenElse { then_case, .. } => find_provide(then_case, seen),
            Stmt::Block(stmts) => stmts.iter().for_each(|s| find_provide(s, seen)),
            _ => {}
        }
    }
    find_provide(&nest, &mut provide_seen);
    assert!(provide_seen, "no provide node in the nest:\n{nest}");
}

#[test]
fn guard_with_if_split_rebases_and_guards() {
    let mut env = arrayloom::environment(vec![Producer::define(
        "f",
        &["x"],
        vec![Expr::var("x")],
    )]);
    ScheduleBuilder::new("f", 0)
        .split("x", "xo", "xi", 7, TailStrategy::GuardWithIf)
        .apply(&mut env)
        .expect("legal split");
    let nest = nest_for(&env["f"]);

    let mut lets = Vec::new();
    collect_let_names(&nest, &mut lets);
    assert!(lets.iter().any(|l| l == "f.s0.x.rebased"), "missing rebased let");
    assert!(lets.iter().any(|l| l == "f.s0.xi.base"), "missing base let");
    assert!(contains_intrinsic(&nest, "likely"), "missing likely guard");

    let mut loops = Vec::new();
    collect_loop_names(&nest, &mut loops);
    assert_eq!(loops, ["f.s0.__outermost", "f.s0.xo", "f.s0.xi"]);
}

#[test]
fn shift_inwards_split_clamps_the_base() {
    let mut env = arrayloom::environment(vec![Producer::define(
        "f",
        &["x"],
        vec![Expr::var("x")],
    )]);
    ScheduleBuilder::new("f", 0)
        .split("x", "xo", "xi", 4, TailStrategy::ShiftInwards)
        .apply(&mut env)
        .expect("legal split");
    let nest = nest_for(&env["f"]);

    // The base binding takes a min against the last legal start.
    let mut clamped = false;
    fn find_base(s: &Stmt, clamped: &mut bool) {
        if let Stmt::Let { name, value, body } = s {
            if name == "f.s0.xi.base" {
                if let Expr::Min(_, _) = value {
                    *clamped = true;
                }
            }
            find_base(body, clamped);
        } else if let Stmt::For { body, .. } = s {
            find_base(body, clamped);
        }
    }
    find_base(&nest, &mut clamped);
    assert!(clamped, "shift-inwards base is not clamped:\n{nest}");
    assert!(contains_intrinsic(&nest, "likely_if_innermost"));
}

#[test]
fn auto_tail_on_update_rounds_up() {
    let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
    f.define_update(
        vec![Expr::var("x")],
        vec![Expr::call("f", vec![Expr::var("x")]) + Expr::IntImm(1)],
        None,
    );
    let mut env = arrayloom::environment(vec![f]);
    ScheduleBuilder::new("f", 1)
        .split("x", "xo", "xi", 3, TailStrategy::Auto)
        .apply(&mut env)
        .expect("legal split");

    let f = &env["f"];
    let nest = build_provide_loop_nest("f", "f.s1.", None, &f.args, &f.updates[0], true)
        .expect("legal schedule");

    // RoundUp means no guard and no clamped base.
    assert!(!contains_intrinsic(&nest, "likely"));
    let mut lets = Vec::new();
    collect_let_names(&nest, &mut lets);
    assert!(!lets.iter().any(|l| l == "f.s1.x.rebased"));
}

#[test]
fn shift_inwards_on_update_is_rejected() {
    let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
    f.define_update(
        vec![Expr::var("x")],
        vec![Expr::call("f", vec![Expr::var("x")]) + Expr::IntImm(1)],
        None,
    );
    let mut env = arrayloom::environment(vec![f]);
    ScheduleBuilder::new("f", 1)
        .split("x", "xo", "xi", 3, TailStrategy::ShiftInwards)
        .apply(&mut env)
        .expect("the builder records the directive");

    let f = &env["f"];
    let err = build_provide_loop_nest("f", "f.s1.", None, &f.args, &f.updates[0], true)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTailStrategyForUpdate { .. }));
}

#[test]
fn exact_split_rejects_round_up() {
    let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
    let rdom = ReductionDomain::new(vec![(
        "r".to_string(),
        Expr::IntImm(0),
        Expr::IntImm(10),
    )]);
    f.define_update(
        vec![Expr::var("x")],
        vec![Expr::call("f", vec![Expr::var("x")]) + Expr::var("r")],
        Some(rdom),
    );
    let mut env = arrayloom::environment(vec![f]);
    ScheduleBuilder::new("f", 1)
        .split("r", "ro", "ri", 4, TailStrategy::RoundUp)
        .apply(&mut env)
        .expect("the builder records the directive");

    let f = &env["f"];
    let err = build_provide_loop_nest("f", "f.s1.", None, &f.args, &f.updates[0], true)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTailStrategyForExactSplit { .. }));
}

#[test]
fn factor_one_split_is_a_body_noop_with_metadata() {
    let mut env = arrayloom::environment(vec![Producer::define(
        "f",
        &["x"],
        vec![Expr::var("x")],
    )]);
    ScheduleBuilder::new("f", 0)
        .split("x", "xo", "xi", 1, TailStrategy::GuardWithIf)
        .apply(&mut env)
        .expect("legal split");
    let nest = nest_for(&env["f"]);

    // No guard is introduced, but the split's loop metadata still is.
    assert!(!contains_intrinsic(&nest, "likely"));
    let mut lets = Vec::new();
    collect_let_names(&nest, &mut lets);
    for expected in [
        "f.s0.xi.loop_min",
        "f.s0.xi.loop_extent",
        "f.s0.xo.loop_min",
        "f.s0.xo.loop_extent",
    ] {
        assert!(lets.iter().any(|l| l == expected), "missing let {expected}");
    }
}

#[test]
fn statically_divisible_split_needs_no_tail() {
    let mut env = arrayloom::environment(vec![Producer::define(
        "f",
        &["x"],
        vec![Expr::var("x")],
    )]);
    ScheduleBuilder::new("f", 0)
        .bound("x", Expr::IntImm(0), Expr::IntImm(28))
        .split("x", "xo", "xi", 7, TailStrategy::GuardWithIf)
        .apply(&mut env)
        .expect("legal schedule");
    let nest = nest_for(&env["f"]);

    // The factor divides the bounded extent, so no guard is emitted.
    assert!(!contains_intrinsic(&nest, "likely"));
    let mut lets = Vec::new();
    collect_let_names(&nest, &mut lets);
    assert!(!lets.iter().any(|l| l == "f.s0.x.rebased"));
}

#[test]
fn reduction_predicate_becomes_a_likely_guard() {
    let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
    let rdom = ReductionDomain::new(vec![(
        "r".to_string(),
        Expr::IntImm(0),
        Expr::IntImm(10),
    )])
    .with_predicate(Expr::var("r").ne(Expr::var("x")));
    f.define_update(
        vec![Expr::var("x")],
        vec![Expr::call("f", vec![Expr::var("x")]) + Expr::var("r")],
        Some(rdom),
    );
    let env = arrayloom::environment(vec![f]);

    let f = &env["f"];
    let nest = build_provide_loop_nest("f", "f.s1.", None, &f.args, &f.updates[0], true)
        .expect("legal schedule");
    assert!(contains_intrinsic(&nest, "likely"), "predicate not guarded:\n{nest}");

    // The guard's variables are qualified into the stage namespace.
    let mut saw_qualified = false;
    for_each_stmt_expr(&nest, &mut |e| {
        if let Expr::Var(v) = e {
            if v == "f.s1.r" {
                saw_qualified = true;
            }
        }
    });
    assert!(saw_qualified, "predicate vars not qualified:\n{nest}");
}

#[test]
fn always_false_predicate_still_builds() {
    let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
    let rdom = ReductionDomain::new(vec![(
        "r".to_string(),
        Expr::IntImm(0),
        Expr::IntImm(10),
    )])
    .with_predicate(Expr::BoolImm(false));
    f.define_update(
        vec![Expr::var("x")],
        vec![Expr::call("f", vec![Expr::var("x")]) + Expr::var("r")],
        Some(rdom),
    );
    let env = arrayloom::environment(vec![f]);

    let f = &env["f"];
    let nest = build_provide_loop_nest("f", "f.s1.", None, &f.args, &f.updates[0], true)
        .expect("an unreachable body still type-checks");
    assert!(contains_intrinsic(&nest, "likely"));
}

#[test]
fn specializations_wrap_in_reverse_declaration_order() {
    let mut f = Producer::define("f", &["x"], vec![Expr::var("x")]);
    f.specialize(Expr::var("c1").gt(Expr::IntImm(0)));
    f.specialize(Expr::var("c2").gt(Expr::IntImm(0)));
    let env = arrayloom::environment(vec![f]);

    let nest = nest_for(&env["f"]);
    // The first declared specialization ends up as the outermost branch.
    match &nest {
        Stmt::IfThenElse { condition, .. } => {
            assert_eq!(*condition, Expr::var("c1").gt(Expr::IntImm(0)));
        }
        other => panic!("expected an if-chain, got:\n{other}"),
    }
}
