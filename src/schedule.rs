//! # Schedule Types
//!
//! The per-stage loop transformation record: dims with loop types, splits,
//! bounds hints, reduction variables, co-schedule requests, and placement
//! levels. Schedules are accumulated through [`ScheduleBuilder`] directives
//! and frozen before the ordering phase runs.

use crate::error::{Error, Result};
use crate::ir::{Expr, LoopType};
use crate::names::{var_name_match, OUTERMOST, ROOT_LOOP};
use crate::producer::Environment;
use crate::target::DeviceApi;

/// A named loop axis of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub var: String,
    pub loop_type: LoopType,
    pub device_api: DeviceApi,
    /// Reduction-variable axes keep this mark through splits so later
    /// transformations know the iteration space is exact.
    pub is_rvar: bool,
}

impl Dim {
    pub fn serial(var: impl Into<String>) -> Dim {
        Dim {
            var: var.into(),
            loop_type: LoopType::Serial,
            device_api: DeviceApi::None,
            is_rvar: false,
        }
    }

    pub fn serial_rvar(var: impl Into<String>) -> Dim {
        Dim {
            is_rvar: true,
            ..Dim::serial(var)
        }
    }
}

/// Policy for the remainder when a split factor does not divide the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStrategy {
    /// GuardWithIf for exact splits, RoundUp for update stages,
    /// ShiftInwards otherwise.
    Auto,
    /// Guard the body with a likely-true bounds check.
    GuardWithIf,
    /// Shift the last tile inward so it stays in bounds (recomputes).
    ShiftInwards,
    /// Iterate past the end; downstream bounds grow to cover it.
    RoundUp,
}

/// What a split record does to the dim list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    /// `old` becomes `outer` and `inner`.
    Split,
    /// `inner` and `outer` collapse into `old`.
    Fuse,
    /// `old` becomes `outer`.
    Rename,
    /// `old` (a reduction variable) becomes the pure var `outer`.
    Purify,
}

/// One loop transformation, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub old_var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Expr,
    /// True when the old var is a reduction variable: the split must not
    /// visit sites outside the domain.
    pub exact: bool,
    pub tail: TailStrategy,
    pub kind: SplitKind,
}

/// Explicit bounds directive on a dim.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub var: String,
    pub min: Option<Expr>,
    pub extent: Option<Expr>,
    pub modulus: Option<Expr>,
}

/// A reduction variable with its domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// Where a producer's loops sit relative to its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopLevel {
    /// Compute at each use site.
    Inline,
    /// Outside all producer loops.
    Root,
    /// Inside the named loop of some producer's stage.
    At {
        func: String,
        stage: usize,
        var: String,
    },
}

impl LoopLevel {
    pub fn at(func: impl Into<String>, stage: usize, var: impl Into<String>) -> LoopLevel {
        LoopLevel::At {
            func: func.into(),
            stage,
            var: var.into(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, LoopLevel::Inline)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }

    /// Does a for-loop with this (fully qualified) name realize this level?
    /// An `At` level deliberately also matches the `.fused.` renames group
    /// injection produces for its stage.
    pub fn matches_loop(&self, loop_name: &str) -> bool {
        match self {
            LoopLevel::Inline => false,
            LoopLevel::Root => loop_name == ROOT_LOOP,
            LoopLevel::At { func, stage, var } => {
                loop_name.starts_with(&format!("{func}.s{stage}."))
                    && loop_name.ends_with(&format!(".{var}"))
            }
        }
    }

    /// The schedule-expression rendering used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            LoopLevel::Inline => "inline".to_string(),
            LoopLevel::Root => "root".to_string(),
            LoopLevel::At { func, stage, var } => format!("{func}.s{stage}.{var}"),
        }
    }
}

/// A co-schedule request: stage (func_2, stage_2) shares outer loops with
/// (func_1, stage_1) from `var_name` outward. Recorded on the schedule of
/// (func_1, stage_1), the fuse parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedPair {
    pub func_1: String,
    pub stage_1: usize,
    pub func_2: String,
    pub stage_2: usize,
    pub var_name: String,
}

/// The complete schedule of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    /// Loop axes, innermost first, ending with the `__outermost` sentinel.
    pub dims: Vec<Dim>,
    /// Loop transformations in declaration order.
    pub splits: Vec<Split>,
    /// Explicit bounds directives.
    pub bounds: Vec<Bound>,
    /// Reduction variables enumerated by this stage.
    pub rvars: Vec<ReductionVariable>,
    /// Co-schedule requests for which this stage is the parent.
    pub fused_pairs: Vec<FusedPair>,
    /// The parent stage and dim this stage is fused into.
    pub fuse_level: LoopLevel,
    /// Where this producer is evaluated. Placement queries read stage 0.
    pub compute_level: LoopLevel,
    /// Where this producer's storage lives.
    pub store_level: LoopLevel,
    /// Whether any directive has been applied.
    pub touched: bool,
}

impl StageSchedule {
    /// The normalized schedule for a stage with the given loop axes: the
    /// axes in order, then the `__outermost` sentinel.
    pub fn with_dims(vars: impl IntoIterator<Item = String>) -> StageSchedule {
        let mut dims: Vec<Dim> = vars.into_iter().map(Dim::serial).collect();
        dims.push(Dim::serial(OUTERMOST));
        StageSchedule {
            dims,
            splits: Vec::new(),
            bounds: Vec::new(),
            rvars: Vec::new(),
            fused_pairs: Vec::new(),
            fuse_level: LoopLevel::Inline,
            compute_level: LoopLevel::Inline,
            store_level: LoopLevel::Inline,
            touched: false,
        }
    }

    /// Index of the dim realizing the unqualified var name.
    pub fn dim_index(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| var_name_match(&d.var, var))
    }
}

/// Directives accumulated by [`ScheduleBuilder`].
#[derive(Debug, Clone)]
enum Directive {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i64,
        tail: TailStrategy,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
    Rename {
        old: String,
        new: String,
    },
    SetLoopType {
        var: String,
        loop_type: LoopType,
        device_api: DeviceApi,
    },
    Reorder {
        vars: Vec<String>,
    },
    Bound {
        var: String,
        min: Option<Expr>,
        extent: Option<Expr>,
        modulus: Option<Expr>,
    },
    ComputeAt(LoopLevel),
    StoreAt(LoopLevel),
    ComputeWith {
        parent_func: String,
        parent_stage: usize,
        var: String,
    },
}

/// Accumulates scheduling directives against one stage of one producer and
/// applies them on [`ScheduleBuilder::apply`]. The environment is only
/// mutated at apply time, so a failed directive leaves it untouched.
#[derive(Debug)]
pub struct ScheduleBuilder {
    func: String,
    stage: usize,
    directives: Vec<Directive>,
}

impl ScheduleBuilder {
    /// Build directives for stage `stage` of `func` (stage 0 is the initial
    /// definition, stage k is update k-1).
    pub fn new(func: impl Into<String>, stage: usize) -> ScheduleBuilder {
        ScheduleBuilder {
            func: func.into(),
            stage,
            directives: Vec::new(),
        }
    }

    pub fn split(
        mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
        tail: TailStrategy,
    ) -> Self {
        self.directives.push(Directive::Split {
            old: old.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor,
            tail,
        });
        self
    }

    pub fn fuse(mut self, inner: &str, outer: &str, fused: &str) -> Self {
        self.directives.push(Directive::Fuse {
            inner: inner.to_string(),
            outer: outer.to_string(),
            fused: fused.to_string(),
        });
        self
    }

    pub fn rename(mut self, old: &str, new: &str) -> Self {
        self.directives.push(Directive::Rename {
            old: old.to_string(),
            new: new.to_string(),
        });
        self
    }

    pub fn parallel(mut self, var: &str) -> Self {
        self.directives.push(Directive::SetLoopType {
            var: var.to_string(),
            loop_type: LoopType::Parallel,
            device_api: DeviceApi::None,
        });
        self
    }

    pub fn vectorize(mut self, var: &str) -> Self {
        self.directives.push(Directive::SetLoopType {
            var: var.to_string(),
            loop_type: LoopType::Vectorized,
            device_api: DeviceApi::None,
        });
        self
    }

    pub fn unroll(mut self, var: &str) -> Self {
        self.directives.push(Directive::SetLoopType {
            var: var.to_string(),
            loop_type: LoopType::Unrolled,
            device_api: DeviceApi::None,
        });
        self
    }

    pub fn gpu_block(mut self, var: &str, device_api: DeviceApi) -> Self {
        self.directives.push(Directive::SetLoopType {
            var: var.to_string(),
            loop_type: LoopType::GpuBlock,
            device_api,
        });
        self
    }

    pub fn gpu_thread(mut self, var: &str, device_api: DeviceApi) -> Self {
        self.directives.push(Directive::SetLoopType {
            var: var.to_string(),
            loop_type: LoopType::GpuThread,
            device_api,
        });
        self
    }

    pub fn reorder(mut self, vars: &[&str]) -> Self {
        self.directives.push(Directive::Reorder {
            vars: vars.iter().map(|v| (*v).to_string()).collect(),
        });
        self
    }

    pub fn bound(mut self, var: &str, min: Expr, extent: Expr) -> Self {
        self.directives.push(Directive::Bound {
            var: var.to_string(),
            min: Some(min),
            extent: Some(extent),
            modulus: None,
        });
        self
    }

    pub fn align_bounds(mut self, var: &str, modulus: Expr) -> Self {
        self.directives.push(Directive::Bound {
            var: var.to_string(),
            min: None,
            extent: None,
            modulus: Some(modulus),
        });
        self
    }

    pub fn compute_at(mut self, func: &str, stage: usize, var: &str) -> Self {
        self.directives
            .push(Directive::ComputeAt(LoopLevel::at(func, stage, var)));
        self
    }

    pub fn compute_root(mut self) -> Self {
        self.directives.push(Directive::ComputeAt(LoopLevel::Root));
        self
    }

    pub fn compute_inline(mut self) -> Self {
        self.directives.push(Directive::ComputeAt(LoopLevel::Inline));
        self
    }

    pub fn store_at(mut self, func: &str, stage: usize, var: &str) -> Self {
        self.directives
            .push(Directive::StoreAt(LoopLevel::at(func, stage, var)));
        self
    }

    pub fn store_root(mut self) -> Self {
        self.directives.push(Directive::StoreAt(LoopLevel::Root));
        self
    }

    /// Co-schedule this stage with `parent_func.s<parent_stage>`, sharing
    /// loops from `var` outward.
    pub fn compute_with(mut self, parent_func: &str, parent_stage: usize, var: &str) -> Self {
        self.directives.push(Directive::ComputeWith {
            parent_func: parent_func.to_string(),
            parent_stage,
            var: var.to_string(),
        });
        self
    }

    /// Apply the accumulated directives to the environment.
    ///
    /// # Panics
    ///
    /// Panics when a directive names a producer, stage, or dim that does not
    /// exist, or a split output that is not fresh; the front end guarantees
    /// well-formed directives.
    pub fn apply(self, env: &mut Environment) -> Result<()> {
        let ScheduleBuilder {
            func,
            stage,
            directives,
        } = self;
        for directive in directives {
            apply_directive(env, &func, stage, directive)?;
        }
        Ok(())
    }
}

fn apply_directive(
    env: &mut Environment,
    func: &str,
    stage: usize,
    directive: Directive,
) -> Result<()> {
    match directive {
        Directive::ComputeWith {
            parent_func,
            parent_stage,
            var,
        } => {
            // The request lands on the parent's schedule; the child records
            // the fuse level.
            {
                let child = producer_mut(env, func);
                let sched = stage_schedule_mut(child, stage);
                sched.fuse_level = LoopLevel::at(&parent_func, parent_stage, &var);
                sched.touched = true;
            }
            let pair = FusedPair {
                func_1: parent_func.clone(),
                stage_1: parent_stage,
                func_2: func.to_string(),
                stage_2: stage,
                var_name: var,
            };
            let parent = producer_mut(env, &parent_func);
            let sched = stage_schedule_mut(parent, parent_stage);
            sched.fused_pairs.push(pair);
            sched.touched = true;
            Ok(())
        }
        other => {
            let producer = producer_mut(env, func);
            apply_stage_directive(func, stage_schedule_mut(producer, stage), stage, other)
        }
    }
}

fn producer_mut<'a>(env: &'a mut Environment, func: &str) -> &'a mut crate::producer::Producer {
    env.get_mut(func)
        .unwrap_or_else(|| panic!("schedule directive names unknown producer '{func}'"))
}

fn stage_schedule_mut(
    producer: &mut crate::producer::Producer,
    stage: usize,
) -> &mut StageSchedule {
    let name = producer.name.clone();
    producer
        .stage_schedule_mut(stage)
        .unwrap_or_else(|| panic!("producer '{name}' has no stage {stage}"))
}

fn apply_stage_directive(
    func: &str,
    sched: &mut StageSchedule,
    _stage: usize,
    directive: Directive,
) -> Result<()> {
    sched.touched = true;
    match directive {
        Directive::Split {
            old,
            outer,
            inner,
            factor,
            tail,
        } => {
            if factor <= 0 {
                return Err(Error::BadSplitFactor {
                    var: old,
                    factor: factor.to_string(),
                });
            }
            let idx = sched
                .dim_index(&old)
                .unwrap_or_else(|| panic!("split of unknown dim '{old}' on '{func}'"));
            for fresh in [&outer, &inner] {
                assert!(
                    sched.dim_index(fresh).is_none(),
                    "split output '{fresh}' is not a fresh name on '{func}'"
                );
            }
            let old_dim = sched.dims[idx].clone();
            let exact = old_dim.is_rvar;
            // The old dim becomes [inner, outer] at its position; the dim
            // list is innermost first.
            sched.dims[idx] = Dim {
                var: inner.clone(),
                ..old_dim.clone()
            };
            sched.dims.insert(
                idx + 1,
                Dim {
                    var: outer.clone(),
                    ..old_dim
                },
            );
            sched.splits.push(Split {
                old_var: old,
                outer,
                inner,
                factor: Expr::IntImm(factor),
                exact,
                tail,
                kind: SplitKind::Split,
            });
            Ok(())
        }
        Directive::Fuse {
            inner,
            outer,
            fused,
        } => {
            let inner_idx = sched
                .dim_index(&inner)
                .unwrap_or_else(|| panic!("fuse of unknown dim '{inner}' on '{func}'"));
            let outer_idx = sched
                .dim_index(&outer)
                .unwrap_or_else(|| panic!("fuse of unknown dim '{outer}' on '{func}'"));
            assert!(
                sched.dim_index(&fused).is_none(),
                "fuse output '{fused}' is not a fresh name on '{func}'"
            );
            let fused_dim = Dim {
                var: fused.clone(),
                is_rvar: sched.dims[inner_idx].is_rvar || sched.dims[outer_idx].is_rvar,
                ..sched.dims[outer_idx].clone()
            };
            let keep = inner_idx.min(outer_idx);
            sched.dims.remove(inner_idx.max(outer_idx));
            sched.dims[keep] = fused_dim;
            sched.splits.push(Split {
                old_var: fused,
                outer,
                inner,
                factor: Expr::IntImm(0),
                exact: false,
                tail: TailStrategy::Auto,
                kind: SplitKind::Fuse,
            });
            Ok(())
        }
        Directive::Rename { old, new } => {
            let idx = sched
                .dim_index(&old)
                .unwrap_or_else(|| panic!("rename of unknown dim '{old}' on '{func}'"));
            assert!(
                sched.dim_index(&new).is_none(),
                "rename target '{new}' is not a fresh name on '{func}'"
            );
            let was_rvar = sched.dims[idx].is_rvar;
            sched.dims[idx].var = new.clone();
            sched.dims[idx].is_rvar = false;
            sched.splits.push(Split {
                old_var: old,
                outer: new,
                inner: String::new(),
                factor: Expr::IntImm(0),
                exact: false,
                tail: TailStrategy::Auto,
                kind: if was_rvar {
                    SplitKind::Purify
                } else {
                    SplitKind::Rename
                },
            });
            Ok(())
        }
        Directive::SetLoopType {
            var,
            loop_type,
            device_api,
        } => {
            let idx = sched
                .dim_index(&var)
                .unwrap_or_else(|| panic!("loop type directive on unknown dim '{var}' of '{func}'"));
            sched.dims[idx].loop_type = loop_type;
            if device_api != DeviceApi::None {
                sched.dims[idx].device_api = device_api;
            }
            Ok(())
        }
        Directive::Reorder { vars } => {
            // The named dims take the given order (innermost first) within
            // the positions they already occupy.
            let indices: Vec<usize> = vars
                .iter()
                .map(|v| {
                    sched
                        .dim_index(v)
                        .unwrap_or_else(|| panic!("reorder names unknown dim '{v}' on '{func}'"))
                })
                .collect();
            let mut slots = indices.clone();
            slots.sort_unstable();
            let reordered: Vec<Dim> = indices.iter().map(|&i| sched.dims[i].clone()).collect();
            for (slot, dim) in slots.into_iter().zip(reordered) {
                sched.dims[slot] = dim;
            }
            Ok(())
        }
        Directive::Bound {
            var,
            min,
            extent,
            modulus,
        } => {
            sched.bounds.push(Bound {
                var,
                min,
                extent,
                modulus,
            });
            Ok(())
        }
        Directive::ComputeAt(level) => {
            sched.compute_level = level;
            Ok(())
        }
        Directive::StoreAt(level) => {
            sched.store_level = level;
            Ok(())
        }
        Directive::ComputeWith { .. } => unreachable!("handled by apply_directive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::Producer;

    fn env_with_f() -> Environment {
        let mut env = Environment::new();
        let f = Producer::define(
            "f",
            &["x", "y"],
            vec![Expr::var("x") + Expr::var("y")],
        );
        env.insert("f".to_string(), f);
        env
    }

    #[test]
    fn split_replaces_dim_with_inner_then_outer() {
        let mut env = env_with_f();
        ScheduleBuilder::new("f", 0)
            .split("x", "xo", "xi", 8, TailStrategy::Auto)
            .apply(&mut env)
            .expect("legal split");
        let sched = env["f"].schedule();
        let vars: Vec<&str> = sched.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(vars, ["xi", "xo", "y", OUTERMOST]);
        assert_eq!(sched.splits.len(), 1);
        assert_eq!(sched.splits[0].kind, SplitKind::Split);
    }

    #[test]
    fn fuse_collapses_two_dims() {
        let mut env = env_with_f();
        ScheduleBuilder::new("f", 0)
            .fuse("x", "y", "t")
            .parallel("t")
            .apply(&mut env)
            .expect("legal fuse");
        let sched = env["f"].schedule();
        let vars: Vec<&str> = sched.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(vars, ["t", OUTERMOST]);
        assert_eq!(sched.dims[0].loop_type, LoopType::Parallel);
    }

    #[test]
    fn nonpositive_split_factor_is_rejected() {
        let mut env = env_with_f();
        let err = ScheduleBuilder::new("f", 0)
            .split("x", "xo", "xi", 0, TailStrategy::Auto)
            .apply(&mut env)
            .unwrap_err();
        assert!(matches!(err, Error::BadSplitFactor { .. }));
    }

    #[test]
    fn compute_with_records_pair_on_parent() {
        let mut env = env_with_f();
        let g = Producer::define("g", &["x", "y"], vec![Expr::var("x") - Expr::var("y")]);
        env.insert("g".to_string(), g);
        ScheduleBuilder::new("g", 0)
            .compute_with("f", 0, "x")
            .apply(&mut env)
            .expect("legal compute_with");

        let parent = env["f"].schedule();
        assert_eq!(parent.fused_pairs.len(), 1);
        assert_eq!(parent.fused_pairs[0].func_2, "g");
        assert_eq!(env["g"].schedule().fuse_level, LoopLevel::at("f", 0, "x"));
    }

    #[test]
    fn loop_level_matching() {
        let level = LoopLevel::at("f", 0, "x");
        assert!(level.matches_loop("f.s0.x"));
        assert!(level.matches_loop("f.s0.fused.x"));
        assert!(!level.matches_loop("f.s1.x"));
        assert!(!level.matches_loop("f.s0.xo"));
        assert!(LoopLevel::Root.matches_loop(ROOT_LOOP));
    }
}
