//! # Expression Simplification
//!
//! Bottom-up constant folding and normalization, applied to fixpoint by
//! construction: each rule's output is already in simplified form, so
//! `simplify(simplify(e)) == simplify(e)`.
//!
//! The contract relied on by the rest of the crate:
//! - pure integer arithmetic over constants collapses;
//! - `min`/`max` collapse when both operands are constants;
//! - `(k % m)` becomes `0` when `m` statically divides `k`;
//! - comparisons and boolean connectives over constants collapse.
//!
//! Division and modulo fold with Euclidean semantics and are left untouched
//! when the divisor is zero.

use crate::ir::visit::contains_impure_call;
use crate::ir::{ArithOp, CmpOp, Expr};

/// Simplify an expression.
pub fn simplify(e: &Expr) -> Expr {
    match e {
        Expr::IntImm(_)
        | Expr::FloatImm(_)
        | Expr::BoolImm(_)
        | Expr::StringImm(_)
        | Expr::Var(_) => e.clone(),
        Expr::Arith { op, a, b } => simplify_arith(*op, simplify(a), simplify(b)),
        Expr::Min(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            match (a.as_const_int(), b.as_const_int()) {
                (Some(x), Some(y)) => Expr::IntImm(x.min(y)),
                _ if a == b && !contains_impure_call(&a) => a,
                _ => Expr::Min(Box::new(a), Box::new(b)),
            }
        }
        Expr::Max(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            match (a.as_const_int(), b.as_const_int()) {
                (Some(x), Some(y)) => Expr::IntImm(x.max(y)),
                _ if a == b && !contains_impure_call(&a) => a,
                _ => Expr::Max(Box::new(a), Box::new(b)),
            }
        }
        Expr::Cmp { op, a, b } => simplify_cmp(*op, simplify(a), simplify(b)),
        Expr::And(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            match (&a, &b) {
                (Expr::BoolImm(false), _) | (_, Expr::BoolImm(false)) => Expr::BoolImm(false),
                (Expr::BoolImm(true), _) => b,
                (_, Expr::BoolImm(true)) => a,
                _ => Expr::And(Box::new(a), Box::new(b)),
            }
        }
        Expr::Or(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            match (&a, &b) {
                (Expr::BoolImm(true), _) | (_, Expr::BoolImm(true)) => Expr::BoolImm(true),
                (Expr::BoolImm(false), _) => b,
                (_, Expr::BoolImm(false)) => a,
                _ => Expr::Or(Box::new(a), Box::new(b)),
            }
        }
        Expr::Not(a) => {
            let a = simplify(a);
            match a {
                Expr::BoolImm(v) => Expr::BoolImm(!v),
                Expr::Not(inner) => *inner,
                _ => Expr::Not(Box::new(a)),
            }
        }
        Expr::Select {
            condition,
            true_value,
            false_value,
        } => {
            let condition = simplify(condition);
            let true_value = simplify(true_value);
            let false_value = simplify(false_value);
            match condition {
                Expr::BoolImm(true) => true_value,
                Expr::BoolImm(false) => false_value,
                _ => Expr::Select {
                    condition: Box::new(condition),
                    true_value: Box::new(true_value),
                    false_value: Box::new(false_value),
                },
            }
        }
        Expr::Call {
            name,
            args,
            call_type,
            value_index,
        } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(simplify).collect(),
            call_type: *call_type,
            value_index: *value_index,
        },
    }
}

fn arith(op: ArithOp, a: Expr, b: Expr) -> Expr {
    Expr::Arith {
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

fn simplify_arith(op: ArithOp, a: Expr, b: Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const_int(), b.as_const_int()) {
        match op {
            ArithOp::Add => return Expr::IntImm(x.wrapping_add(y)),
            ArithOp::Sub => return Expr::IntImm(x.wrapping_sub(y)),
            ArithOp::Mul => return Expr::IntImm(x.wrapping_mul(y)),
            ArithOp::Div if y != 0 => return Expr::IntImm(x.div_euclid(y)),
            ArithOp::Mod if y != 0 => return Expr::IntImm(x.rem_euclid(y)),
            _ => {}
        }
    }
    match op {
        ArithOp::Add => {
            if a.is_zero() {
                return b;
            }
            if b.is_zero() {
                return a;
            }
            // Reassociate (x + c1) + c2 so constants accumulate.
            if let (Expr::Arith { op: ArithOp::Add, a: x, b: c1 }, Some(c2)) =
                (&a, b.as_const_int())
            {
                if let Some(c1) = c1.as_const_int() {
                    return arith(
                        ArithOp::Add,
                        (**x).clone(),
                        Expr::IntImm(c1.wrapping_add(c2)),
                    );
                }
            }
        }
        ArithOp::Sub => {
            if b.is_zero() {
                return a;
            }
            if a == b && !contains_impure_call(&a) {
                return Expr::IntImm(0);
            }
        }
        ArithOp::Mul => {
            if a.is_zero() || b.is_zero() {
                return Expr::IntImm(0);
            }
            if a.is_one() {
                return b;
            }
            if b.is_one() {
                return a;
            }
        }
        ArithOp::Div => {
            if b.is_one() {
                return a;
            }
        }
        ArithOp::Mod => {
            if b.is_one() {
                return Expr::IntImm(0);
            }
        }
    }
    arith(op, a, b)
}

fn simplify_cmp(op: CmpOp, a: Expr, b: Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const_int(), b.as_const_int()) {
        let v = match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
        return Expr::BoolImm(v);
    }
    if a == b && !contains_impure_call(&a) {
        let v = match op {
            CmpOp::Eq | CmpOp::Le | CmpOp::Ge => true,
            CmpOp::Ne | CmpOp::Lt | CmpOp::Gt => false,
        };
        return Expr::BoolImm(v);
    }
    Expr::Cmp {
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{max, min};

    #[test]
    fn constant_arithmetic_collapses() {
        let e = (Expr::IntImm(6) + Expr::IntImm(1)) * Expr::IntImm(4);
        assert_eq!(simplify(&e), Expr::IntImm(28));
    }

    #[test]
    fn modulo_of_divisible_constant_is_zero() {
        let e = Expr::IntImm(14) % Expr::IntImm(7);
        assert_eq!(simplify(&e), Expr::IntImm(0));
        let e = Expr::IntImm(15) % Expr::IntImm(7);
        assert_eq!(simplify(&e), Expr::IntImm(1));
    }

    #[test]
    fn division_is_euclidean() {
        assert_eq!(
            simplify(&(Expr::IntImm(-7) / Expr::IntImm(2))),
            Expr::IntImm(-4)
        );
        assert_eq!(
            simplify(&(Expr::IntImm(-7) % Expr::IntImm(2))),
            Expr::IntImm(1)
        );
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let e = Expr::IntImm(3) / Expr::IntImm(0);
        assert_eq!(simplify(&e), e);
    }

    #[test]
    fn identities_collapse() {
        let x = Expr::var("x");
        assert_eq!(simplify(&(x.clone() + Expr::IntImm(0))), x);
        assert_eq!(simplify(&(x.clone() * Expr::IntImm(1))), x);
        assert_eq!(simplify(&(x.clone() * Expr::IntImm(0))), Expr::IntImm(0));
        assert_eq!(simplify(&(x.clone() - x.clone())), Expr::IntImm(0));
    }

    #[test]
    fn min_max_of_constants_collapse() {
        assert_eq!(
            simplify(&min(Expr::IntImm(3), Expr::IntImm(5))),
            Expr::IntImm(3)
        );
        assert_eq!(
            simplify(&max(Expr::IntImm(3), Expr::IntImm(5))),
            Expr::IntImm(5)
        );
        let sym = min(Expr::var("a"), Expr::IntImm(5));
        assert_eq!(simplify(&sym), sym);
    }

    #[test]
    fn select_on_constant_condition() {
        let e = Expr::Select {
            condition: Box::new(Expr::IntImm(1).lt(Expr::IntImm(2))),
            true_value: Box::new(Expr::var("a")),
            false_value: Box::new(Expr::var("b")),
        };
        assert_eq!(simplify(&e), Expr::var("a"));
    }

    #[test]
    fn simplify_is_idempotent() {
        let exprs = vec![
            (Expr::var("x") + Expr::IntImm(3)) + Expr::IntImm(4),
            min(Expr::var("a"), Expr::var("b")) + Expr::IntImm(0),
            (Expr::var("n") % Expr::IntImm(1)) + Expr::var("m"),
            Expr::Not(Box::new(Expr::var("p").le(Expr::var("q")))),
        ];
        for e in exprs {
            let once = simplify(&e);
            assert_eq!(simplify(&once), once, "not idempotent for {e}");
        }
    }
}
