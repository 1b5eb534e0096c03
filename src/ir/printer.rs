//! # IR Printing
//!
//! `Display` for expressions and statements. The output is the diagnostic
//! syntax used in error messages and in the determinism tests: two runs over
//! the same inputs must print identical trees.

use std::fmt;

use super::{ArithOp, CallType, CmpOp, Expr, Stmt};

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntImm(v) => write!(f, "{v}"),
            Expr::FloatImm(v) => write!(f, "{v:?}"),
            Expr::BoolImm(v) => write!(f, "{v}"),
            Expr::StringImm(s) => write!(f, "{s:?}"),
            Expr::Var(name) => f.write_str(name),
            Expr::Arith { op, a, b } => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Mod => "%",
                };
                write!(f, "({a} {sym} {b})")
            }
            Expr::Min(a, b) => write!(f, "min({a}, {b})"),
            Expr::Max(a, b) => write!(f, "max({a}, {b})"),
            Expr::Cmp { op, a, b } => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({a} {sym} {b})")
            }
            Expr::And(a, b) => write!(f, "({a} && {b})"),
            Expr::Or(a, b) => write!(f, "({a} || {b})"),
            Expr::Not(a) => write!(f, "!({a})"),
            Expr::Select {
                condition,
                true_value,
                false_value,
            } => write!(f, "select({condition}, {true_value}, {false_value})"),
            Expr::Call {
                name,
                args,
                call_type,
                value_index,
            } => {
                f.write_str(name)?;
                if *call_type == CallType::Producer && *value_index > 0 {
                    write!(f, "[{value_index}]")?;
                }
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        f.write_str("  ")?;
    }
    Ok(())
}

fn print_stmt(s: &Stmt, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    match s {
        Stmt::Let { name, value, body } => {
            indent(f, depth)?;
            writeln!(f, "let {name} = {value}")?;
            print_stmt(body, f, depth)
        }
        Stmt::For {
            name,
            min,
            extent,
            loop_type,
            body,
            ..
        } => {
            indent(f, depth)?;
            writeln!(f, "for<{loop_type:?}> {name} in [{min}, {min} + {extent}):")?;
            print_stmt(body, f, depth + 1)
        }
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            indent(f, depth)?;
            writeln!(f, "if ({condition}):")?;
            print_stmt(then_case, f, depth + 1)?;
            if let Some(else_case) = else_case {
                indent(f, depth)?;
                writeln!(f, "else:")?;
                print_stmt(else_case, f, depth + 1)?;
            }
            Ok(())
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                print_stmt(s, f, depth)?;
            }
            Ok(())
        }
        Stmt::Provide { name, values, args } => {
            indent(f, depth)?;
            write!(f, "{name}(")?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{a}")?;
            }
            f.write_str(") = ")?;
            if values.len() == 1 {
                writeln!(f, "{}", values[0])
            } else {
                f.write_str("{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                writeln!(f, "}}")
            }
        }
        Stmt::Realize {
            name,
            bounds,
            condition,
            body,
            ..
        } => {
            indent(f, depth)?;
            write!(f, "realize {name}(")?;
            for (i, r) in bounds.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "[{}, {}]", r.min, r.extent)?;
            }
            write!(f, ")")?;
            if !condition.is_one() && *condition != Expr::BoolImm(true) {
                write!(f, " if {condition}")?;
            }
            writeln!(f, ":")?;
            print_stmt(body, f, depth + 1)
        }
        Stmt::ProducerConsumer {
            name,
            is_producer,
            body,
        } => {
            indent(f, depth)?;
            if *is_producer {
                writeln!(f, "produce {name}:")?;
            } else {
                writeln!(f, "consume {name}:")?;
            }
            print_stmt(body, f, depth + 1)
        }
        Stmt::Assert { condition, message } => {
            indent(f, depth)?;
            writeln!(f, "assert({condition}, {message})")
        }
        Stmt::Evaluate(e) => {
            indent(f, depth)?;
            writeln!(f, "{e}")
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        print_stmt(self, f, 0)
    }
}
