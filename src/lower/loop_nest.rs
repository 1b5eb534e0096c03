//! # Per-Stage Loop Nests
//!
//! Builds the decorated loop nest computing one stage of one producer:
//! the provide node innermost, split/fuse/rename rewrites applied to the
//! body, the for/let/if wrappers sorted and rewrapped, and the loop
//! metadata lets emitted outermost so bounds inference can resolve every
//! `*.loop_min`/`*.loop_max`/`*.loop_extent` reference.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{Error, Result};
use crate::ir::substitute::{qualify, substitute_in_stmt};
use crate::ir::visit::{contains_impure_call, expr_uses_var};
use crate::ir::{likely, likely_if_innermost, min, Expr, Stmt};
use crate::names::OUTERMOST;
use crate::producer::Definition;
use crate::schedule::{SplitKind, StageSchedule, TailStrategy};
use crate::simplify::simplify;

/// A containing let, if-guard, or for-loop collected while the nest is
/// reorderable.
enum Wrapper {
    For { dim_idx: usize, name: String },
    Let { name: String, value: Expr },
    If { value: Expr },
}

impl Wrapper {
    fn name(&self) -> &str {
        match self {
            Wrapper::For { name, .. } | Wrapper::Let { name, .. } => name,
            Wrapper::If { .. } => "",
        }
    }

    fn value(&self) -> Option<&Expr> {
        match self {
            Wrapper::Let { value, .. } | Wrapper::If { value } => Some(value),
            Wrapper::For { .. } => None,
        }
    }
}

fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

/// Build a loop nest around a provide node using one stage's schedule.
///
/// `start_fuse` marks the dim index from which this stage shares loops with
/// a co-scheduled parent; guards are injected from there outward so the
/// unified iteration space never writes out of bounds.
pub fn build_provide_loop_nest(
    func_name: &str,
    prefix: &str,
    start_fuse: Option<usize>,
    dims: &[String],
    def: &Definition,
    is_update: bool,
) -> Result<Stmt> {
    assert_eq!(
        !is_update, def.is_init,
        "stage kind disagrees with its definition"
    );

    let site: Vec<Expr> = def.args.iter().map(|a| qualify(prefix, a)).collect();
    let values: Vec<Expr> = def.values.iter().map(|v| qualify(prefix, v)).collect();

    let mut stmt = build_loop_nest_helper(
        func_name,
        prefix,
        start_fuse,
        dims,
        site,
        values,
        &def.split_predicate(),
        &def.schedule,
        is_update,
    )?;

    // Specialized copies, last declared innermost in the if-chain.
    for spec in def.specializations.iter().rev() {
        let then_case =
            build_provide_loop_nest(func_name, prefix, start_fuse, dims, &spec.definition, is_update)?;
        stmt = Stmt::if_then_else(spec.condition.clone(), then_case, stmt);
    }

    Ok(stmt)
}

#[allow(clippy::too_many_arguments)]
fn build_loop_nest_helper(
    func_name: &str,
    prefix: &str,
    start_fuse: Option<usize>,
    dims: &[String],
    site: Vec<Expr>,
    values: Vec<Expr>,
    predicates: &[Expr],
    s: &StageSchedule,
    is_update: bool,
) -> Result<Stmt> {
    trace!(func = func_name, prefix, "building loop nest");

    // Innermost: the store itself.
    let mut stmt = Stmt::Provide {
        name: func_name.to_string(),
        values,
        args: site,
    };

    // Guard the fused loop vars so the unified iteration space does not run
    // off this stage's own bounds. The sentinel dim is exempt; it is
    // removed later anyway.
    if let Some(sf) = start_fuse {
        for dim in s.dims.iter().take(s.dims.len() - 1).skip(sf) {
            let v = var(format!("{prefix}{}", dim.var));
            let lo = var(format!("{prefix}{}.loop_min", dim.var));
            let hi = var(format!("{prefix}{}.loop_max", dim.var));
            stmt = Stmt::if_then(likely(lo.le(v.clone())), stmt);
            stmt = Stmt::if_then(likely(v.le(hi)), stmt);
        }
    }

    // Dims whose extent is known to be a multiple of some expression, from
    // bounds directives and the reduction domain. Splits consult and extend
    // this to prove divisibility.
    let mut dim_extent_alignment: BTreeMap<String, Expr> = BTreeMap::new();
    for b in &s.bounds {
        if let Some(extent) = &b.extent {
            dim_extent_alignment.insert(b.var.clone(), extent.clone());
        }
        if let Some(modulus) = &b.modulus {
            dim_extent_alignment.insert(b.var.clone(), modulus.clone());
        }
    }
    for rv in &s.rvars {
        dim_extent_alignment.insert(rv.var.clone(), rv.extent.clone());
    }

    // Define the stage args in terms of the loop variables using the splits.
    for split in &s.splits {
        let outer = var(format!("{prefix}{}", split.outer));
        match split.kind {
            SplitKind::Split => {
                let inner = var(format!("{prefix}{}", split.inner));
                let old_max = var(format!("{prefix}{}.loop_max", split.old_var));
                let old_min = var(format!("{prefix}{}.loop_min", split.old_var));
                let old_extent = var(format!("{prefix}{}.loop_extent", split.old_var));

                dim_extent_alignment.insert(split.inner.clone(), split.factor.clone());

                let mut base = outer.clone() * split.factor.clone() + old_min.clone();
                let base_name = format!("{prefix}{}.base", split.inner);
                let base_var = var(base_name.clone());
                let old_var_name = format!("{prefix}{}", split.old_var);

                if is_update && split.tail == TailStrategy::ShiftInwards {
                    return Err(Error::InvalidTailStrategyForUpdate {
                        var: split.old_var.clone(),
                    });
                }
                if split.exact
                    && !matches!(split.tail, TailStrategy::Auto | TailStrategy::GuardWithIf)
                {
                    return Err(Error::InvalidTailStrategyForExactSplit {
                        var: split.old_var.clone(),
                    });
                }

                let tail = match split.tail {
                    TailStrategy::Auto => {
                        if split.exact {
                            TailStrategy::GuardWithIf
                        } else if is_update {
                            TailStrategy::RoundUp
                        } else {
                            TailStrategy::ShiftInwards
                        }
                    }
                    other => other,
                };

                let proven_divisible = dim_extent_alignment
                    .get(&split.old_var)
                    .map(|align| simplify(&(align.clone() % split.factor.clone())).is_zero())
                    .unwrap_or(false);

                if proven_divisible {
                    // The split factor divides the old extent; no base
                    // adjustment or guard is needed.
                    let align = dim_extent_alignment[&split.old_var].clone();
                    dim_extent_alignment
                        .insert(split.outer.clone(), align / split.factor.clone());
                } else if split
                    .factor
                    .as_const_int()
                    .is_some_and(|f| f <= 0)
                {
                    return Err(Error::BadSplitFactor {
                        var: split.old_var.clone(),
                        factor: split.factor.to_string(),
                    });
                } else if split.factor.is_one() {
                    // Trivially divides; nothing new is known about the
                    // outer dim.
                } else if tail == TailStrategy::GuardWithIf {
                    // Rebase against a single var so bounds inference can
                    // understand the if-condition's restriction.
                    let rebased = outer.clone() * split.factor.clone() + inner.clone();
                    let rebased_name = format!("{prefix}{}.rebased", split.old_var);
                    let rebased_var = var(rebased_name.clone());
                    stmt = substitute_in_stmt(
                        &old_var_name,
                        &(rebased_var.clone() + old_min.clone()),
                        &stmt,
                    );
                    let cond = likely(rebased_var.lt(old_extent));
                    stmt = Stmt::if_then(cond, stmt);
                    stmt = Stmt::let_stmt(rebased_name, rebased, stmt);
                } else if tail == TailStrategy::ShiftInwards {
                    // Pull the last tile inward so it cannot store past the
                    // end of the realization.
                    base = likely_if_innermost(base);
                    base = min(base, old_max + (Expr::IntImm(1) - split.factor.clone()));
                } else {
                    assert_eq!(tail, TailStrategy::RoundUp, "unhandled tail strategy");
                }

                // Substitute the new expression for the split variable, and
                // also bind it as a let for bounds inference.
                stmt = substitute_in_stmt(&old_var_name, &(base_var.clone() + inner.clone()), &stmt);
                stmt = Stmt::let_stmt(old_var_name, base_var + inner, stmt);
                stmt = Stmt::let_stmt(base_name, base, stmt);
            }
            SplitKind::Fuse => {
                // Define inner and outer in terms of the fused var. The max
                // with one keeps lifted bounds free of division by zero
                // when the inner loop is never entered.
                let fused = var(format!("{prefix}{}", split.old_var));
                let inner_min = var(format!("{prefix}{}.loop_min", split.inner));
                let outer_min = var(format!("{prefix}{}.loop_min", split.outer));
                let inner_extent = var(format!("{prefix}{}.loop_extent", split.inner));

                let factor = crate::ir::max(inner_extent, Expr::IntImm(1));
                let inner_val = fused.clone() % factor.clone() + inner_min;
                let outer_val = fused / factor + outer_min;

                let inner_name = format!("{prefix}{}", split.inner);
                let outer_name = format!("{prefix}{}", split.outer);
                stmt = substitute_in_stmt(&inner_name, &inner_val, &stmt);
                stmt = substitute_in_stmt(&outer_name, &outer_val, &stmt);
                stmt = Stmt::let_stmt(inner_name, inner_val, stmt);
                stmt = Stmt::let_stmt(outer_name, outer_val, stmt);

                // Keep the known size of the fused dim when possible, for
                // later splits.
                if let (Some(ia), Some(oa)) = (
                    dim_extent_alignment.get(&split.inner).cloned(),
                    dim_extent_alignment.get(&split.outer).cloned(),
                ) {
                    dim_extent_alignment.insert(split.old_var.clone(), ia * oa);
                }
            }
            SplitKind::Rename | SplitKind::Purify => {
                let old_name = format!("{prefix}{}", split.old_var);
                stmt = substitute_in_stmt(&old_name, &outer, &stmt);
                stmt = Stmt::let_stmt(old_name, outer, stmt);
            }
        }
    }

    // Collect the containing wrappers, outermost first: the for loops, then
    // the lets the splits accumulated, then the reduction-domain guards.
    let mut nest: Vec<Wrapper> = Vec::new();
    for i in (0..s.dims.len()).rev() {
        nest.push(Wrapper::For {
            dim_idx: i,
            name: format!("{prefix}{}", s.dims[i].var),
        });
    }
    loop {
        match stmt {
            Stmt::Let { name, value, body } => {
                nest.push(Wrapper::Let { name, value });
                stmt = *body;
            }
            other => {
                stmt = other;
                break;
            }
        }
    }
    let n_predicates = predicates.len();
    for pred in predicates {
        nest.push(Wrapper::If {
            value: qualify(prefix, pred),
        });
    }

    // Push the lets outward as far as their free variables permit, by
    // reverse insertion sort.
    let n_dims = s.dims.len();
    for i in n_dims..nest.len() - n_predicates {
        debug_assert!(matches!(nest[i], Wrapper::Let { .. }));
        for j in (0..i).rev() {
            let blocked = {
                let value = nest[j + 1].value().expect("sortable wrappers carry a value");
                expr_uses_var(value, nest[j].name())
            };
            if blocked {
                break;
            }
            nest.swap(j + 1, j);
        }
    }

    // Same for the predicate guards, except one containing an impure call
    // must stay put to preserve the observable call count.
    for i in nest.len() - n_predicates..nest.len() {
        debug_assert!(matches!(nest[i], Wrapper::If { .. }));
        if contains_impure_call(nest[i].value().expect("guards carry a value")) {
            continue;
        }
        for j in (0..i).rev() {
            let blocked = {
                let value = nest[j + 1].value().expect("sortable wrappers carry a value");
                expr_uses_var(value, nest[j].name())
            };
            if blocked {
                break;
            }
            nest.swap(j + 1, j);
        }
    }

    // Rewrap the statement in the sorted containers.
    for wrapper in nest.iter().rev() {
        stmt = match wrapper {
            Wrapper::Let { name, value } => Stmt::let_stmt(name.clone(), value.clone(), stmt),
            Wrapper::If { value } => Stmt::if_then(likely(value.clone()), stmt),
            Wrapper::For { dim_idx, name } => {
                let dim = &s.dims[*dim_idx];
                Stmt::For {
                    name: name.clone(),
                    min: var(format!("{name}.loop_min")),
                    extent: var(format!("{name}.loop_extent")),
                    loop_type: dim.loop_type,
                    device_api: dim.device_api,
                    body: Box::new(stmt),
                }
            }
        };
    }

    // Define the bounds of the split dimensions from the bounds of the
    // stage args (first declared split outermost, since later splits may
    // consume its outputs).
    for split in s.splits.iter().rev() {
        let old_extent = var(format!("{prefix}{}.loop_extent", split.old_var));
        let old_max = var(format!("{prefix}{}.loop_max", split.old_var));
        let old_min = var(format!("{prefix}{}.loop_min", split.old_var));
        match split.kind {
            SplitKind::Split => {
                let inner_extent = split.factor.clone();
                let outer_extent =
                    (old_max - old_min + split.factor.clone()) / split.factor.clone();
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_min", split.inner),
                    Expr::IntImm(0),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_max", split.inner),
                    inner_extent.clone() - Expr::IntImm(1),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_extent", split.inner),
                    inner_extent,
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_min", split.outer),
                    Expr::IntImm(0),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_max", split.outer),
                    outer_extent.clone() - Expr::IntImm(1),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_extent", split.outer),
                    outer_extent,
                    stmt,
                );
            }
            SplitKind::Fuse => {
                let inner_extent = var(format!("{prefix}{}.loop_extent", split.inner));
                let outer_extent = var(format!("{prefix}{}.loop_extent", split.outer));
                let fused_extent = inner_extent * outer_extent;
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_min", split.old_var),
                    Expr::IntImm(0),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_max", split.old_var),
                    fused_extent.clone() - Expr::IntImm(1),
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_extent", split.old_var),
                    fused_extent,
                    stmt,
                );
            }
            SplitKind::Rename => {
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_min", split.outer),
                    old_min,
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_max", split.outer),
                    old_max,
                    stmt,
                );
                stmt = Stmt::let_stmt(
                    format!("{prefix}{}.loop_extent", split.outer),
                    old_extent,
                    stmt,
                );
            }
            SplitKind::Purify => {}
        }
    }

    // Bounds of the sentinel dim.
    {
        let o = format!("{prefix}{OUTERMOST}");
        stmt = Stmt::let_stmt(format!("{o}.loop_min"), Expr::IntImm(0), stmt);
        stmt = Stmt::let_stmt(format!("{o}.loop_max"), Expr::IntImm(0), stmt);
        stmt = Stmt::let_stmt(format!("{o}.loop_extent"), Expr::IntImm(1), stmt);
    }

    // Loop bounds of the stage args in terms of the mins and maxes bounds
    // inference will supply.
    for arg in dims {
        let v = format!("{prefix}{arg}");
        let max = var(format!("{v}.max"));
        let min_v = var(format!("{v}.min"));
        stmt = Stmt::let_stmt(
            format!("{v}.loop_extent"),
            (max.clone() + Expr::IntImm(1)) - min_v.clone(),
            stmt,
        );
        stmt = Stmt::let_stmt(format!("{v}.loop_min"), min_v, stmt);
        stmt = Stmt::let_stmt(format!("{v}.loop_max"), max, stmt);
    }

    // Loop bounds of the reduction variables, likewise.
    for rv in &s.rvars {
        let p = format!("{prefix}{}", rv.var);
        let rmin = var(format!("{p}.min"));
        let rmax = var(format!("{p}.max"));
        stmt = Stmt::let_stmt(format!("{p}.loop_min"), rmin.clone(), stmt);
        stmt = Stmt::let_stmt(format!("{p}.loop_max"), rmax.clone(), stmt);
        stmt = Stmt::let_stmt(
            format!("{p}.loop_extent"),
            rmax - rmin + Expr::IntImm(1),
            stmt,
        );
    }

    Ok(stmt)
}
