//! Whole-pipeline lowering tests: inlining, realize/marker brackets,
//! extern stages, explicit bounds, and the output guarantees downstream
//! passes rely on.

use std::collections::BTreeSet;

use arrayloom::ir::visit::for_each_stmt_expr;
use arrayloom::ir::{CallType, Expr, Stmt};
use arrayloom::producer::ExternArgument;
use arrayloom::{environment, lower, Environment, Producer, ScheduleBuilder, Target};

fn x() -> Expr {
    Expr::var("x")
}

fn y() -> Expr {
    Expr::var("y")
}

fn outputs(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

fn two_stage_env() -> Environment {
    let f = Producer::define("f", &["x", "y"], vec![x() + y()]);
    let g = Producer::define(
        "g",
        &["x", "y"],
        vec![Expr::call("f", vec![x(), y()]) * 2.into()],
    );
    environment(vec![f, g])
}

fn tree_text(env: &Environment, outs: &[&str], target: &Target) -> String {
    lower(&outputs(outs), env, target)
        .expect("schedulable")
        .to_string()
}

#[test]
fn inline_producer_disappears_from_the_tree() {
    let env = two_stage_env();
    let stmt = lower(&outputs(&["g"]), &env, &Target::host()).expect("schedulable");

    let mut f_calls = 0;
    for_each_stmt_expr(&stmt, &mut |e| {
        if let Expr::Call {
            name,
            call_type: CallType::Producer,
            ..
        } = e
        {
            if name == "f" {
                f_calls += 1;
            }
        }
    });
    assert_eq!(f_calls, 0, "inlined producer still referenced:\n{stmt}");

    let text = stmt.to_string();
    assert!(!text.contains("realize f"), "inlined producer allocated:\n{text}");
}

#[test]
fn root_producer_gets_realize_and_markers() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_root()
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");

    let text = tree_text(&env, &["g"], &Target::host());
    assert!(text.contains("realize f"), "missing realize:\n{text}");
    assert!(text.contains("produce f:"), "missing producer marker:\n{text}");
    assert!(text.contains("consume f:"), "missing consumer marker:\n{text}");
    // Outputs live in caller storage.
    assert!(!text.contains("realize g"));
    // Realize bounds use the conventional names bounds inference binds.
    assert!(text.contains("f.x.min_realized"));
    assert!(text.contains("f.x.extent_realized"));
}

#[test]
fn sentinel_and_root_loops_are_gone() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_root()
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");

    let text = tree_text(&env, &["g"], &Target::host());
    assert!(!text.contains("__outermost"), "sentinel survived:\n{text}");
    assert!(!text.contains("<root>"), "root loop survived:\n{text}");
}

#[test]
fn lowering_is_deterministic() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_at("g", 0, "y")
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");

    let a = tree_text(&env, &["g"], &Target::host());
    let b = tree_text(&env, &["g"], &Target::host());
    assert_eq!(a, b, "two runs over the same inputs must print identically");
}

#[test]
fn explicit_bounds_emit_runtime_checks() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_root()
        .store_root()
        .bound("x", Expr::IntImm(0), Expr::IntImm(64))
        .apply(&mut env)
        .expect("legal schedule");

    let text = tree_text(&env, &["g"], &Target::host());
    assert!(
        text.contains("arrayloom_error_explicit_bounds_too_small"),
        "missing bounds assertion:\n{text}"
    );
    assert!(text.contains("f.s0.x.min_unbounded"));

    // NoAsserts strips the runtime checks.
    let no_asserts: Target = "host-no_asserts".parse().expect("valid target");
    let text = tree_text(&env, &["g"], &no_asserts);
    assert!(!text.contains("arrayloom_error_explicit_bounds_too_small"));
}

#[test]
fn every_variable_is_bound_or_conventional() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_at("g", 0, "y")
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");
    let stmt = lower(&outputs(&["g"]), &env, &Target::host()).expect("schedulable");

    fn check(s: &Stmt, bound: &mut BTreeSet<String>, unbound: &mut BTreeSet<String>) {
        let free_in = |e: &Expr, bound: &BTreeSet<String>, unbound: &mut BTreeSet<String>| {
            arrayloom::ir::visit::for_each_expr(e, &mut |node| {
                if let Expr::Var(v) = node {
                    if !bound.contains(v) {
                        unbound.insert(v.clone());
                    }
                }
            });
        };
        match s {
            Stmt::Let { name, value, body } => {
                free_in(value, bound, unbound);
                let fresh = bound.insert(name.clone());
                check(body, bound, unbound);
                if fresh {
                    bound.remove(name);
                }
            }
            Stmt::For {
                name,
                min,
                extent,
                body,
                ..
            } => {
                free_in(min, bound, unbound);
                free_in(extent, bound, unbound);
                let fresh = bound.insert(name.clone());
                check(body, bound, unbound);
                if fresh {
                    bound.remove(name);
                }
            }
            Stmt::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                free_in(condition, bound, unbound);
                check(then_case, bound, unbound);
                if let Some(e) = else_case {
                    check(e, bound, unbound);
                }
            }
            Stmt::Block(stmts) => stmts.iter().for_each(|s| check(s, bound, unbound)),
            Stmt::Provide { values, args, .. } => {
                for e in values.iter().chain(args.iter()) {
                    free_in(e, bound, unbound);
                }
            }
            Stmt::Realize {
                bounds: ranges,
                condition,
                body,
                ..
            } => {
                for r in ranges {
                    free_in(&r.min, bound, unbound);
                    free_in(&r.extent, bound, unbound);
                }
                free_in(condition, bound, unbound);
                check(body, bound, unbound);
            }
            Stmt::ProducerConsumer { body, .. } => check(body, bound, unbound),
            Stmt::Assert { condition, message } => {
                free_in(condition, bound, unbound);
                free_in(message, bound, unbound);
            }
            Stmt::Evaluate(e) => free_in(e, bound, unbound),
        }
    }

    let mut bound = BTreeSet::new();
    let mut unbound = BTreeSet::new();
    check(&stmt, &mut bound, &mut unbound);

    // Everything left free must be a name bounds inference (or the caller)
    // supplies by convention.
    let conventional = |v: &str| {
        v.ends_with(".min")
            || v.ends_with(".max")
            || v.ends_with(".min_realized")
            || v.ends_with(".extent_realized")
            || v.ends_with(".min_unbounded")
            || v.ends_with(".max_unbounded")
            || v.ends_with(".buffer")
            || v.contains(".stride.")
    };
    let rogue: Vec<&String> = unbound.iter().filter(|v| !conventional(v)).collect();
    assert!(rogue.is_empty(), "unbound non-conventional vars: {rogue:?}\n{stmt}");
}

#[test]
fn extern_stage_lowers_to_a_checked_call() {
    let f = Producer::define("f", &["x", "y"], vec![x() + y()]);
    let e = Producer::define("e", &["x", "y"], vec![0.into()]).with_extern(
        "external_blur",
        vec![
            ExternArgument::Expr(Expr::IntImm(3)),
            ExternArgument::Producer("f".to_string()),
        ],
        false,
    );
    let h = Producer::define("h", &["x", "y"], vec![Expr::call("e", vec![x(), y()])]);
    let mut env = environment(vec![f, e, h]);
    ScheduleBuilder::new("f", 0)
        .compute_root()
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");
    ScheduleBuilder::new("e", 0)
        .compute_root()
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");

    let text = tree_text(&env, &["h"], &Target::host());
    assert!(text.contains("external_blur("), "missing extern call:\n{text}");
    assert!(text.contains("f.buffer"), "missing input buffer handle:\n{text}");
    assert!(text.contains("e.buffer"), "missing output buffer handle:\n{text}");
    assert!(
        text.contains("arrayloom_error_extern_stage_failed"),
        "missing result check:\n{text}"
    );
    assert!(text.contains("let t0 ="), "result bound to a fresh name:\n{text}");
    // Store and compute coincide, so no subregion buffer is synthesized.
    assert!(!text.contains("create_buffer_t"));
}

#[test]
fn extern_stage_with_split_store_synthesizes_a_buffer() {
    let f = Producer::define("f", &["x", "y"], vec![x() + y()]);
    let e = Producer::define("e", &["x", "y"], vec![0.into()]).with_extern(
        "external_blur",
        vec![ExternArgument::Producer("f".to_string())],
        false,
    );
    let h = Producer::define("h", &["x", "y"], vec![Expr::call("e", vec![x(), y()])]);
    let mut env = environment(vec![f, e, h]);
    ScheduleBuilder::new("f", 0)
        .compute_root()
        .store_root()
        .apply(&mut env)
        .expect("legal schedule");
    ScheduleBuilder::new("e", 0)
        .store_root()
        .compute_at("h", 0, "y")
        .apply(&mut env)
        .expect("legal schedule");

    let text = tree_text(&env, &["h"], &Target::host());
    assert!(text.contains("create_buffer_t"), "missing subregion buffer:\n{text}");
    assert!(text.contains("address_of"), "missing host pointer:\n{text}");
    assert!(text.contains("e.0.tmp_buffer"), "missing temp handle:\n{text}");
    assert!(text.contains("e.stride.0"), "missing stride reference:\n{text}");
}

#[test]
fn msan_target_annotates_extern_buffers() {
    let f = Producer::define("f", &["x", "y"], vec![x() + y()]);
    let e = Producer::define("e", &["x", "y"], vec![0.into()]).with_extern(
        "external_blur",
        vec![ExternArgument::Producer("f".to_string())],
        false,
    );
    let h = Producer::define("h", &["x", "y"], vec![Expr::call("e", vec![x(), y()])]);
    let mut env = environment(vec![f, e, h]);
    for name in ["f", "e"] {
        ScheduleBuilder::new(name, 0)
            .compute_root()
            .store_root()
            .apply(&mut env)
            .expect("legal schedule");
    }

    let host = tree_text(&env, &["h"], &Target::host());
    assert!(!host.contains("halide_msan_annotate_memory_is_initialized"));

    let msan: Target = "host-msan".parse().expect("valid target");
    let text = tree_text(&env, &["h"], &msan);
    assert!(
        text.contains("halide_msan_annotate_memory_is_initialized"),
        "missing msan record annotation:\n{text}"
    );
    assert!(
        text.contains("halide_msan_annotate_buffer_is_initialized"),
        "missing msan contents annotation:\n{text}"
    );
}

#[test]
fn compute_at_places_the_producer_inside_the_consumer() {
    let mut env = two_stage_env();
    ScheduleBuilder::new("f", 0)
        .compute_at("g", 0, "y")
        .store_at("g", 0, "y")
        .apply(&mut env)
        .expect("legal schedule");

    let stmt = lower(&outputs(&["g"]), &env, &Target::host()).expect("schedulable");

    // Walk to g's y loop and check f's production is inside it.
    fn loop_body<'a>(s: &'a Stmt, name: &str) -> Option<&'a Stmt> {
        match s {
            Stmt::For {
                name: n, body: b, ..
            } if n == name => Some(&**b),
            Stmt::For { body, .. }
            | Stmt::Let { body, .. }
            | Stmt::Realize { body, .. }
            | Stmt::ProducerConsumer { body, .. } => loop_body(body, name),
            Stmt::Block(stmts) => stmts.iter().find_map(|s| loop_body(s, name)),
            Stmt::IfThenElse {
                then_case,
                else_case,
                ..
            } => loop_body(then_case, name).or_else(|| {
                else_case.as_ref().and_then(|e| loop_body(e, name))
            }),
            _ => None,
        }
    }

    let y_body = loop_body(&stmt, "g.s0.y").expect("g's y loop exists");
    let inner_text = y_body.to_string();
    assert!(
        inner_text.contains("produce f:"),
        "f not computed inside g.s0.y:\n{stmt}"
    );
    assert!(
        inner_text.contains("realize f"),
        "f not stored inside g.s0.y:\n{stmt}"
    );
}
