//! # Call-Graph Analysis
//!
//! Direct and transitive callee extraction over the producer environment.
//! A stage referencing its own producer (a self-loop on an update stage) is
//! the one permitted form of recursion; everything else is a cyclic
//! pipeline.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::ir::visit::for_each_expr;
use crate::ir::{CallType, Expr};
use crate::producer::{Definition, Environment, Producer};

fn collect_expr_calls(e: &Expr, out: &mut Vec<String>, seen: &mut BTreeSet<String>) {
    for_each_expr(e, &mut |node| {
        if let Expr::Call {
            name,
            call_type: CallType::Producer,
            ..
        } = node
        {
            if seen.insert(name.clone()) {
                out.push(name.clone());
            }
        }
    });
}

fn collect_definition_calls(def: &Definition, out: &mut Vec<String>, seen: &mut BTreeSet<String>) {
    for v in &def.values {
        collect_expr_calls(v, out, seen);
    }
    for a in &def.args {
        collect_expr_calls(a, out, seen);
    }
    if let Some(rdom) = &def.rdom {
        for rv in &rdom.vars {
            collect_expr_calls(&rv.min, out, seen);
            collect_expr_calls(&rv.extent, out, seen);
        }
        for p in &rdom.predicates {
            collect_expr_calls(p, out, seen);
        }
    }
    for s in &def.specializations {
        collect_expr_calls(&s.condition, out, seen);
        collect_definition_calls(&s.definition, out, seen);
    }
}

/// Producer names called anywhere in `p`'s definitions (initial, updates,
/// specialization bodies, reduction-domain bounds and predicates), in first
/// occurrence order. Extern inputs count as calls.
pub fn direct_calls(p: &Producer) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for def in p.definitions() {
        collect_definition_calls(def, &mut out, &mut seen);
    }
    if let Some(ext) = &p.extern_def {
        for arg in &ext.args {
            match arg {
                crate::producer::ExternArgument::Producer(name) => {
                    if seen.insert(name.clone()) {
                        out.push(name.clone());
                    }
                }
                crate::producer::ExternArgument::Expr(e) => {
                    collect_expr_calls(e, &mut out, &mut seen);
                }
                _ => {}
            }
        }
    }
    out
}

/// Producer names called by the initial definition only. A self-reference
/// here is a genuine cycle, not a permitted update-stage self-loop.
fn initial_stage_calls(p: &Producer) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    collect_definition_calls(&p.init, &mut out, &mut seen);
    out
}

/// Reflexive transitive closure of [`direct_calls`] for every producer in
/// the environment, memoized across producers.
///
/// Fails with [`Error::CyclicPipeline`] when a back-edge is found that is
/// not a self-loop on an update stage.
pub fn all_transitive_calls(env: &Environment) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut memo: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut on_stack: BTreeSet<String> = BTreeSet::new();

    for (name, producer) in env {
        if initial_stage_calls(producer).iter().any(|c| c == name) {
            return Err(Error::CyclicPipeline { func: name.clone() });
        }
        visit(name, env, &mut memo, &mut on_stack)?;
    }
    Ok(memo)
}

/// Reflexive transitive closure of [`direct_calls`] for one producer.
pub fn transitive_calls(env: &Environment, name: &str) -> Result<BTreeSet<String>> {
    let mut memo = BTreeMap::new();
    let mut on_stack = BTreeSet::new();
    visit(name, env, &mut memo, &mut on_stack)?;
    Ok(memo
        .remove(name)
        .expect("visit populates the memo for its root"))
}

fn visit(
    name: &str,
    env: &Environment,
    memo: &mut BTreeMap<String, BTreeSet<String>>,
    on_stack: &mut BTreeSet<String>,
) -> Result<()> {
    if memo.contains_key(name) {
        return Ok(());
    }
    if !on_stack.insert(name.to_string()) {
        return Err(Error::CyclicPipeline {
            func: name.to_string(),
        });
    }
    let mut result: BTreeSet<String> = BTreeSet::new();
    result.insert(name.to_string());
    if let Some(producer) = env.get(name) {
        for callee in direct_calls(producer) {
            if callee == name {
                // Self-loop on an update stage.
                continue;
            }
            if !env.contains_key(&callee) {
                continue;
            }
            if on_stack.contains(&callee) {
                return Err(Error::CyclicPipeline { func: callee });
            }
            visit(&callee, env, memo, on_stack)?;
            result.extend(memo[&callee].iter().cloned());
        }
    }
    on_stack.remove(name);
    memo.insert(name.to_string(), result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{environment, ReductionDomain};

    fn call(name: &str) -> Expr {
        Expr::call(name, vec![Expr::var("x")])
    }

    #[test]
    fn direct_calls_cover_all_definition_parts() {
        let mut f = Producer::define("f", &["x"], vec![call("a") + call("b")]);
        let rdom = ReductionDomain::new(vec![(
            "r".to_string(),
            Expr::IntImm(0),
            call("c"),
        )])
        .with_predicate(call("d").lt(Expr::IntImm(5)));
        f.define_update(
            vec![Expr::var("x")],
            vec![call("f") + Expr::var("r")],
            Some(rdom),
        );

        let calls = direct_calls(&f);
        assert_eq!(calls, ["a", "b", "f", "c", "d"]);
    }

    #[test]
    fn transitive_closure_is_reflexive() {
        let a = Producer::define("a", &["x"], vec![Expr::var("x").into()]);
        let b = Producer::define("b", &["x"], vec![call("a")]);
        let env = environment(vec![a, b]);

        let calls = transitive_calls(&env, "b").expect("acyclic");
        assert!(calls.contains("a"));
        assert!(calls.contains("b"));
    }

    #[test]
    fn cycle_is_detected() {
        let a = Producer::define("a", &["x"], vec![call("b")]);
        let b = Producer::define("b", &["x"], vec![call("a")]);
        let env = environment(vec![a, b]);

        let err = all_transitive_calls(&env).unwrap_err();
        assert!(matches!(err, Error::CyclicPipeline { .. }));
    }

    #[test]
    fn update_self_loop_is_not_a_cycle() {
        let mut f = Producer::define("f", &["x"], vec![Expr::IntImm(0)]);
        f.define_update(vec![Expr::var("x")], vec![call("f") + Expr::IntImm(1)], None);
        let env = environment(vec![f]);

        let calls = all_transitive_calls(&env).expect("self-loop on update is allowed");
        assert!(calls["f"].contains("f"));
    }

    #[test]
    fn initial_stage_self_reference_is_a_cycle() {
        let f = Producer::define("f", &["x"], vec![call("f")]);
        let env = environment(vec![f]);
        let err = all_transitive_calls(&env).unwrap_err();
        assert!(matches!(err, Error::CyclicPipeline { func } if func == "f"));
    }
}
