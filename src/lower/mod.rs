//! # Scheduling Driver
//!
//! Walks the fuse groups in reverse realization order, validating and
//! injecting each into the growing statement tree: inline substitution for
//! inlinable singletons, single-producer injection otherwise, group
//! injection for co-scheduled sets. The finished tree has the root loop
//! stripped and every `__outermost` sentinel loop deleted.

mod group;
mod inject;
mod loop_nest;

use tracing::debug;

use crate::error::Result;
use crate::inline::inline_function;
use crate::ir::{Expr, LoopType, Stmt};
use crate::names::{NameGen, ROOT_LOOP};
use crate::producer::Environment;
use crate::realization_order::realization_order;
use crate::schedule::LoopLevel;
use crate::target::{DeviceApi, Target};
use crate::validate::{validate_fused_groups, validate_schedule};

pub use loop_nest::build_provide_loop_nest;

/// Lower a pipeline: compute the realization order, then schedule. Output
/// producers with untouched schedules default to root placement.
pub fn lower(outputs: &[String], env: &Environment, target: &Target) -> Result<Stmt> {
    let mut env = env.clone();
    for name in outputs {
        let producer = env
            .get_mut(name)
            .unwrap_or_else(|| panic!("output '{name}' is not in the environment"));
        let sched = producer
            .stage_schedule_mut(0)
            .expect("every producer has an initial stage");
        if !sched.touched && sched.compute_level.is_inline() {
            sched.compute_level = LoopLevel::Root;
            sched.store_level = LoopLevel::Root;
        }
    }

    let plan = realization_order(outputs, &env)?;
    schedule_pipeline(outputs, &plan.order, &plan.fused_groups, &env, target)
}

/// Translate the ordered, partitioned pipeline into a single statement
/// tree.
pub fn schedule_pipeline(
    outputs: &[String],
    order: &[String],
    fused_groups: &[Vec<String>],
    env: &Environment,
    target: &Target,
) -> Result<Stmt> {
    // The groups must concatenate to exactly the realization order.
    {
        let mut iter = order.iter();
        for group in fused_groups {
            assert!(!group.is_empty(), "empty fuse group");
            for name in group {
                assert_eq!(
                    iter.next(),
                    Some(name),
                    "fuse groups are not sorted by the realization order"
                );
            }
        }
        assert_eq!(iter.next(), None, "realization order has unpartitioned entries");
    }

    validate_fused_groups(fused_groups, env)?;

    let mut s = Stmt::For {
        name: ROOT_LOOP.to_string(),
        min: Expr::IntImm(0),
        extent: Expr::IntImm(1),
        loop_type: LoopType::Serial,
        device_api: DeviceApi::Host,
        body: Box::new(Stmt::Evaluate(Expr::IntImm(0))),
    };

    let mut names = NameGen::new();

    for group in fused_groups.iter().rev() {
        let funcs: Vec<&crate::producer::Producer> = group
            .iter()
            .map(|name| {
                env.get(name)
                    .unwrap_or_else(|| panic!("group member '{name}' is not in the environment"))
            })
            .collect();
        let is_output_list: Vec<bool> = group
            .iter()
            .map(|name| outputs.contains(name))
            .collect();

        // Validate members innermost-last, against the tree built so far.
        for (f, &is_output) in funcs.iter().zip(&is_output_list).rev() {
            validate_schedule(f, &s, target, is_output, env)?;
        }

        if funcs.len() == 1 {
            let f = funcs[0];
            if f.can_be_inlined() && f.compute_level().is_inline() {
                debug!(producer = %f.name, "inlining");
                s = inline_function(&s, f);
            } else {
                debug!(producer = %f.name, "injecting realization");
                let mut injector =
                    inject::InjectRealization::new(f, is_output_list[0], target, env, &mut names);
                s = injector.mutate(&s)?;
                assert!(
                    injector.found_store_level && injector.found_compute_level,
                    "store or compute level of '{}' not found after injection",
                    f.name
                );
            }
        } else {
            debug!(group = ?group, "injecting fused group realization");
            let mut injector = group::InjectGroupRealization::new(
                funcs,
                is_output_list,
                target,
                env,
                &mut names,
            );
            s = injector.mutate(&s)?;
            assert!(
                injector.found_store_level && injector.found_compute_level,
                "store or compute level of fused group {group:?} not found after injection"
            );
        }
    }

    // The loop over root has served its purpose.
    let s = match s {
        Stmt::For { name, body, .. } => {
            assert_eq!(name, ROOT_LOOP, "root loop was displaced during injection");
            *body
        }
        other => panic!("scheduling did not preserve the root loop: {other}"),
    };

    Ok(inject::remove_loops_over_outermost(&s))
}
