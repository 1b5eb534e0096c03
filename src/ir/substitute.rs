//! # Substitution and Qualification
//!
//! Free-variable substitution over expressions and statements, and the
//! qualification step that rewrites a definition's unqualified vars into the
//! `<producer>.s<stage>.` namespace before nest construction.

use super::visit::map_expr_children;
use super::{Expr, Range, Stmt};

/// Replace free occurrences of the variable `name` with `value`.
pub fn substitute(name: &str, value: &Expr, e: &Expr) -> Expr {
    match e {
        Expr::Var(v) if v == name => value.clone(),
        _ => map_expr_children(e, &mut |child| substitute(name, value, child)),
    }
}

/// Replace free occurrences of `name` throughout a statement tree. Let
/// bindings and for-loop variables of the same name shadow: the binder's
/// own value (or min/extent) is still rewritten, but its body is not.
pub fn substitute_in_stmt(name: &str, value: &Expr, s: &Stmt) -> Stmt {
    match s {
        Stmt::Let {
            name: let_name,
            value: let_value,
            body,
        } if let_name == name => Stmt::Let {
            name: let_name.clone(),
            value: substitute(name, value, let_value),
            body: body.clone(),
        },
        Stmt::For {
            name: loop_name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } if loop_name == name => Stmt::For {
            name: loop_name.clone(),
            min: substitute(name, value, min),
            extent: substitute(name, value, extent),
            loop_type: *loop_type,
            device_api: *device_api,
            body: body.clone(),
        },
        Stmt::Let {
            name: let_name,
            value: let_value,
            body,
        } => Stmt::Let {
            name: let_name.clone(),
            value: substitute(name, value, let_value),
            body: Box::new(substitute_in_stmt(name, value, body)),
        },
        Stmt::For {
            name: loop_name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } => Stmt::For {
            name: loop_name.clone(),
            min: substitute(name, value, min),
            extent: substitute(name, value, extent),
            loop_type: *loop_type,
            device_api: *device_api,
            body: Box::new(substitute_in_stmt(name, value, body)),
        },
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            condition: substitute(name, value, condition),
            then_case: Box::new(substitute_in_stmt(name, value, then_case)),
            else_case: else_case
                .as_ref()
                .map(|e| Box::new(substitute_in_stmt(name, value, e))),
        },
        Stmt::Provide {
            name: p,
            values,
            args,
        } => Stmt::Provide {
            name: p.clone(),
            values: values.iter().map(|v| substitute(name, value, v)).collect(),
            args: args.iter().map(|a| substitute(name, value, a)).collect(),
        },
        Stmt::Realize {
            name: r,
            types,
            bounds,
            condition,
            body,
        } => Stmt::Realize {
            name: r.clone(),
            types: types.clone(),
            bounds: bounds
                .iter()
                .map(|range| {
                    Range::new(
                        substitute(name, value, &range.min),
                        substitute(name, value, &range.extent),
                    )
                })
                .collect(),
            condition: substitute(name, value, condition),
            body: Box::new(substitute_in_stmt(name, value, body)),
        },
        Stmt::Assert { condition, message } => Stmt::Assert {
            condition: substitute(name, value, condition),
            message: substitute(name, value, message),
        },
        Stmt::Evaluate(e) => Stmt::Evaluate(substitute(name, value, e)),
        Stmt::Block(stmts) => Stmt::Block(
            stmts
                .iter()
                .map(|child| substitute_in_stmt(name, value, child))
                .collect(),
        ),
        Stmt::ProducerConsumer {
            name: p,
            is_producer,
            body,
        } => Stmt::ProducerConsumer {
            name: p.clone(),
            is_producer: *is_producer,
            body: Box::new(substitute_in_stmt(name, value, body)),
        },
    }
}

/// Prefix every unqualified variable with the stage namespace. Names that
/// already contain a `.` are either qualified loop vars or conventional
/// external references and pass through untouched.
pub fn qualify(prefix: &str, e: &Expr) -> Expr {
    match e {
        Expr::Var(v) if !v.contains('.') => Expr::Var(format!("{prefix}{v}")),
        _ => map_expr_children(e, &mut |child| qualify(prefix, child)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::LoopType;
    use crate::target::DeviceApi;

    #[test]
    fn substitute_replaces_free_occurrences() {
        let e = Expr::var("x") + Expr::var("y");
        let out = substitute("x", &Expr::IntImm(3), &e);
        assert_eq!(out, Expr::IntImm(3) + Expr::var("y"));
    }

    #[test]
    fn let_binding_shadows_body() {
        let s = Stmt::let_stmt(
            "x",
            Expr::var("x") + Expr::IntImm(1),
            Stmt::Evaluate(Expr::var("x")),
        );
        let out = substitute_in_stmt("x", &Expr::IntImm(9), &s);
        // The let's value sees the substitution, the body keeps the binding.
        match out {
            Stmt::Let { value, body, .. } => {
                assert_eq!(value, Expr::IntImm(9) + Expr::IntImm(1));
                assert_eq!(*body, Stmt::Evaluate(Expr::var("x")));
            }
            other => panic!("expected let, got {other:?}"),
        }
    }

    #[test]
    fn for_loop_var_shadows_body() {
        let s = Stmt::For {
            name: "x".to_string(),
            min: Expr::var("x"),
            extent: Expr::IntImm(8),
            loop_type: LoopType::Serial,
            device_api: DeviceApi::None,
            body: Box::new(Stmt::Evaluate(Expr::var("x"))),
        };
        let out = substitute_in_stmt("x", &Expr::IntImm(0), &s);
        match out {
            Stmt::For { min, body, .. } => {
                assert_eq!(min, Expr::IntImm(0));
                assert_eq!(*body, Stmt::Evaluate(Expr::var("x")));
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    fn qualify_skips_dotted_names() {
        let e = Expr::var("x") + Expr::var("f.s0.y");
        let out = qualify("f.s0.", &e);
        assert_eq!(out, Expr::var("f.s0.x") + Expr::var("f.s0.y"));
    }
}
