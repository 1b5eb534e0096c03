//! # Structural Traversal
//!
//! Fold helpers over the two IR enums plus the pure analyses built on them.
//! Passes that need custom behavior on a handful of node kinds match those
//! kinds explicitly and fall back to [`map_expr_children`] /
//! [`map_stmt_exprs`] for the rest, rebuilding only the spine they touch.

use super::{Expr, Range, Stmt};

/// Rebuild an expression from its children after applying `f` to each.
/// `f` is responsible for its own recursion.
pub fn map_expr_children(e: &Expr, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
    match e {
        Expr::IntImm(_)
        | Expr::FloatImm(_)
        | Expr::BoolImm(_)
        | Expr::StringImm(_)
        | Expr::Var(_) => e.clone(),
        Expr::Arith { op, a, b } => Expr::Arith {
            op: *op,
            a: Box::new(f(a)),
            b: Box::new(f(b)),
        },
        Expr::Min(a, b) => Expr::Min(Box::new(f(a)), Box::new(f(b))),
        Expr::Max(a, b) => Expr::Max(Box::new(f(a)), Box::new(f(b))),
        Expr::Cmp { op, a, b } => Expr::Cmp {
            op: *op,
            a: Box::new(f(a)),
            b: Box::new(f(b)),
        },
        Expr::And(a, b) => Expr::And(Box::new(f(a)), Box::new(f(b))),
        Expr::Or(a, b) => Expr::Or(Box::new(f(a)), Box::new(f(b))),
        Expr::Not(a) => Expr::Not(Box::new(f(a))),
        Expr::Select {
            condition,
            true_value,
            false_value,
        } => Expr::Select {
            condition: Box::new(f(condition)),
            true_value: Box::new(f(true_value)),
            false_value: Box::new(f(false_value)),
        },
        Expr::Call {
            name,
            args,
            call_type,
            value_index,
        } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| f(a)).collect(),
            call_type: *call_type,
            value_index: *value_index,
        },
    }
}

/// Apply `f` to every expression held directly by `s` and recurse into child
/// statements. `f` is responsible for recursing into sub-expressions.
pub fn map_stmt_exprs(s: &Stmt, f: &mut impl FnMut(&Expr) -> Expr) -> Stmt {
    match s {
        Stmt::Let { name, value, body } => Stmt::Let {
            name: name.clone(),
            value: f(value),
            body: Box::new(map_stmt_exprs(body, f)),
        },
        Stmt::For {
            name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } => Stmt::For {
            name: name.clone(),
            min: f(min),
            extent: f(extent),
            loop_type: *loop_type,
            device_api: *device_api,
            body: Box::new(map_stmt_exprs(body, f)),
        },
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            condition: f(condition),
            then_case: Box::new(map_stmt_exprs(then_case, f)),
            else_case: else_case
                .as_ref()
                .map(|e| Box::new(map_stmt_exprs(e, f))),
        },
        Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(|s| map_stmt_exprs(s, f)).collect()),
        Stmt::Provide { name, values, args } => Stmt::Provide {
            name: name.clone(),
            values: values.iter().map(|v| f(v)).collect(),
            args: args.iter().map(|a| f(a)).collect(),
        },
        Stmt::Realize {
            name,
            types,
            bounds,
            condition,
            body,
        } => Stmt::Realize {
            name: name.clone(),
            types: types.clone(),
            bounds: bounds
                .iter()
                .map(|r| Range::new(f(&r.min), f(&r.extent)))
                .collect(),
            condition: f(condition),
            body: Box::new(map_stmt_exprs(body, f)),
        },
        Stmt::ProducerConsumer {
            name,
            is_producer,
            body,
        } => Stmt::ProducerConsumer {
            name: name.clone(),
            is_producer: *is_producer,
            body: Box::new(map_stmt_exprs(body, f)),
        },
        Stmt::Assert { condition, message } => Stmt::Assert {
            condition: f(condition),
            message: f(message),
        },
        Stmt::Evaluate(e) => Stmt::Evaluate(f(e)),
    }
}

/// Rebuild a statement applying `f` to each direct child statement.
/// Expressions are left alone; `f` is responsible for its own recursion.
pub fn map_stmt_children<E>(
    s: &Stmt,
    f: &mut impl FnMut(&Stmt) -> std::result::Result<Stmt, E>,
) -> std::result::Result<Stmt, E> {
    Ok(match s {
        Stmt::Let { name, value, body } => Stmt::Let {
            name: name.clone(),
            value: value.clone(),
            body: Box::new(f(body)?),
        },
        Stmt::For {
            name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } => Stmt::For {
            name: name.clone(),
            min: min.clone(),
            extent: extent.clone(),
            loop_type: *loop_type,
            device_api: *device_api,
            body: Box::new(f(body)?),
        },
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            condition: condition.clone(),
            then_case: Box::new(f(then_case)?),
            else_case: match else_case {
                Some(e) => Some(Box::new(f(e)?)),
                None => None,
            },
        },
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                out.push(f(s)?);
            }
            Stmt::Block(out)
        }
        Stmt::Realize {
            name,
            types,
            bounds,
            condition,
            body,
        } => Stmt::Realize {
            name: name.clone(),
            types: types.clone(),
            bounds: bounds.clone(),
            condition: condition.clone(),
            body: Box::new(f(body)?),
        },
        Stmt::ProducerConsumer {
            name,
            is_producer,
            body,
        } => Stmt::ProducerConsumer {
            name: name.clone(),
            is_producer: *is_producer,
            body: Box::new(f(body)?),
        },
        Stmt::Provide { .. } | Stmt::Assert { .. } | Stmt::Evaluate(_) => s.clone(),
    })
}

/// Preorder walk over an expression.
pub fn for_each_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    f(e);
    match e {
        Expr::IntImm(_)
        | Expr::FloatImm(_)
        | Expr::BoolImm(_)
        | Expr::StringImm(_)
        | Expr::Var(_) => {}
        Expr::Arith { a, b, .. } | Expr::Cmp { a, b, .. } => {
            for_each_expr(a, f);
            for_each_expr(b, f);
        }
        Expr::Min(a, b) | Expr::Max(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            for_each_expr(a, f);
            for_each_expr(b, f);
        }
        Expr::Not(a) => for_each_expr(a, f),
        Expr::Select {
            condition,
            true_value,
            false_value,
        } => {
            for_each_expr(condition, f);
            for_each_expr(true_value, f);
            for_each_expr(false_value, f);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                for_each_expr(arg, f);
            }
        }
    }
}

/// Preorder walk over every expression in a statement tree.
pub fn for_each_stmt_expr(s: &Stmt, f: &mut impl FnMut(&Expr)) {
    match s {
        Stmt::Let { value, body, .. } => {
            for_each_expr(value, f);
            for_each_stmt_expr(body, f);
        }
        Stmt::For {
            min, extent, body, ..
        } => {
            for_each_expr(min, f);
            for_each_expr(extent, f);
            for_each_stmt_expr(body, f);
        }
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            for_each_expr(condition, f);
            for_each_stmt_expr(then_case, f);
            if let Some(e) = else_case {
                for_each_stmt_expr(e, f);
            }
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                for_each_stmt_expr(s, f);
            }
        }
        Stmt::Provide { values, args, .. } => {
            for v in values {
                for_each_expr(v, f);
            }
            for a in args {
                for_each_expr(a, f);
            }
        }
        Stmt::Realize {
            bounds,
            condition,
            body,
            ..
        } => {
            for r in bounds {
                for_each_expr(&r.min, f);
                for_each_expr(&r.extent, f);
            }
            for_each_expr(condition, f);
            for_each_stmt_expr(body, f);
        }
        Stmt::ProducerConsumer { body, .. } => for_each_stmt_expr(body, f),
        Stmt::Assert { condition, message } => {
            for_each_expr(condition, f);
            for_each_expr(message, f);
        }
        Stmt::Evaluate(e) => for_each_expr(e, f),
    }
}

/// True when the expression references the variable `name`.
pub fn expr_uses_var(e: &Expr, name: &str) -> bool {
    let mut found = false;
    for_each_expr(e, &mut |node| {
        if let Expr::Var(v) = node {
            if v == name {
                found = true;
            }
        }
    });
    found
}

/// True when the expression contains any call whose callee is not pure.
/// Guards containing such calls must not be reordered: doing so would change
/// the observable call count.
pub fn contains_impure_call(e: &Expr) -> bool {
    let mut found = false;
    for_each_expr(e, &mut |node| {
        if let Expr::Call { call_type, .. } = node {
            if !call_type.is_pure() {
                found = true;
            }
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CallType;

    #[test]
    fn uses_var_sees_through_nesting() {
        let e = Expr::var("a") + crate::ir::min(Expr::var("b"), Expr::IntImm(3));
        assert!(expr_uses_var(&e, "a"));
        assert!(expr_uses_var(&e, "b"));
        assert!(!expr_uses_var(&e, "c"));
    }

    #[test]
    fn impure_call_detection() {
        let pure = Expr::call("f", vec![Expr::var("x")]);
        assert!(!contains_impure_call(&pure));

        let impure = Expr::IntImm(1) + Expr::extern_call("external_stage", vec![]);
        assert!(contains_impure_call(&impure));

        let intrinsic = Expr::intrinsic("likely", vec![Expr::var("x")]);
        assert!(matches!(
            intrinsic,
            Expr::Call {
                call_type: CallType::Intrinsic,
                ..
            }
        ));
        assert!(!contains_impure_call(&intrinsic));
    }
}
