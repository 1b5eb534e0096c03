//! # Inline Substitution
//!
//! Replaces every reference to an inlinable producer with its right-hand
//! side, arguments substituted. Only pure producers with a single (initial)
//! definition qualify; the validator has already rejected specializations on
//! anything scheduled inline.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ir::visit::{map_expr_children, map_stmt_exprs};
use crate::ir::{CallType, Expr, Stmt};
use crate::producer::Producer;

/// Replace every producer-reference call to `f` in the tree with `f`'s
/// value at the call's arguments.
pub fn inline_function(s: &Stmt, f: &Producer) -> Stmt {
    assert!(
        f.can_be_inlined(),
        "producer '{}' cannot be inlined",
        f.name
    );
    debug!(producer = %f.name, "inlining");
    map_stmt_exprs(s, &mut |e| inline_in_expr(e, f))
}

fn inline_in_expr(e: &Expr, f: &Producer) -> Expr {
    // Children first, so arguments that themselves call `f` are already
    // resolved when they are substituted into the body.
    let e = map_expr_children(e, &mut |child| inline_in_expr(child, f));
    match &e {
        Expr::Call {
            name,
            args,
            call_type: CallType::Producer,
            value_index,
        } if name == &f.name => {
            assert_eq!(
                args.len(),
                f.args.len(),
                "call to '{}' has wrong arity",
                f.name
            );
            // All formals are replaced in one pass. Substituting them one at
            // a time would let a later formal capture occurrences introduced
            // by an earlier actual (e.g. f(y, x) against f(x, y) = x + y).
            let bindings: BTreeMap<&str, &Expr> = f
                .args
                .iter()
                .map(String::as_str)
                .zip(args.iter())
                .collect();
            substitute_all(&f.init.values[*value_index], &bindings)
        }
        _ => e,
    }
}

fn substitute_all(e: &Expr, bindings: &BTreeMap<&str, &Expr>) -> Expr {
    match e {
        Expr::Var(v) => match bindings.get(v.as_str()) {
            Some(actual) => (*actual).clone(),
            None => e.clone(),
        },
        _ => map_expr_children(e, &mut |child| substitute_all(child, bindings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::visit::for_each_stmt_expr;

    #[test]
    fn inlining_eliminates_all_references() {
        let f = Producer::define(
            "f",
            &["x", "y"],
            vec![Expr::var("x") + Expr::var("y")],
        );
        let s = Stmt::Provide {
            name: "g".to_string(),
            values: vec![
                Expr::call("f", vec![Expr::var("u") + Expr::IntImm(1), Expr::var("v")])
                    * Expr::IntImm(2),
            ],
            args: vec![Expr::var("u"), Expr::var("v")],
        };

        let out = inline_function(&s, &f);
        let mut saw_f = false;
        for_each_stmt_expr(&out, &mut |e| {
            if let Expr::Call { name, .. } = e {
                if name == "f" {
                    saw_f = true;
                }
            }
        });
        assert!(!saw_f, "inlined tree still references f:\n{out}");

        match out {
            Stmt::Provide { values, .. } => {
                assert_eq!(
                    values[0],
                    ((Expr::var("u") + Expr::IntImm(1)) + Expr::var("v")) * Expr::IntImm(2)
                );
            }
            other => panic!("expected provide, got {other:?}"),
        }
    }

    #[test]
    fn nested_self_arguments_resolve_inside_out() {
        let f = Producer::define("f", &["x"], vec![Expr::var("x") * Expr::IntImm(3)]);
        let s = Stmt::Evaluate(Expr::call(
            "f",
            vec![Expr::call("f", vec![Expr::var("t")])],
        ));
        let out = inline_function(&s, &f);
        assert_eq!(
            out,
            Stmt::Evaluate((Expr::var("t") * Expr::IntImm(3)) * Expr::IntImm(3))
        );
    }

    #[test]
    fn swapped_formal_names_do_not_capture() {
        // f(x, y) = x + 2 * y, called as f(y, x): the substitution of x
        // with y must not be re-hit by the substitution of y with x.
        let f = Producer::define(
            "f",
            &["x", "y"],
            vec![Expr::var("x") + Expr::IntImm(2) * Expr::var("y")],
        );
        let s = Stmt::Evaluate(Expr::call("f", vec![Expr::var("y"), Expr::var("x")]));
        let out = inline_function(&s, &f);
        assert_eq!(
            out,
            Stmt::Evaluate(Expr::var("y") + Expr::IntImm(2) * Expr::var("x"))
        );
    }
}
