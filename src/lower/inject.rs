//! # Realization Injection
//!
//! Builds a producer's full production (initial stage plus updates, or the
//! extern call) and splices it into the consumer's statement tree at the
//! producer's compute level, with the allocation bracket at its store
//! level.

use tracing::debug;

use crate::error::Result;
use crate::ir::substitute::substitute_in_stmt;
use crate::ir::visit::{for_each_stmt_expr, map_stmt_children};
use crate::ir::{CallType, Expr, LoopType, Range, Stmt};
use crate::names::{stage_prefix, NameGen, OUTERMOST};
use crate::producer::{Environment, ExternArgument, Producer};
use crate::target::{Feature, Target};

use super::loop_nest::build_provide_loop_nest;

/// Runtime hook reporting a nonzero extern-stage result.
pub(crate) const EXTERN_STAGE_FAILED: &str = "arrayloom_error_extern_stage_failed";
/// Runtime hook reporting explicit bounds narrower than the inferred ones.
pub(crate) const EXPLICIT_BOUNDS_TOO_SMALL: &str = "arrayloom_error_explicit_bounds_too_small";

/// True when the statement references the producer, either by call or
/// through one of its `.buffer` handles.
pub(crate) fn function_is_used_in_stmt(func: &str, s: &Stmt) -> bool {
    let mut used = false;
    for_each_stmt_expr(s, &mut |e| match e {
        Expr::Call {
            name,
            call_type: CallType::Producer,
            ..
        } if name == func => used = true,
        Expr::Var(v) if v.starts_with(&format!("{func}.")) && v.ends_with(".buffer") => {
            used = true;
        }
        _ => {}
    });
    used
}

/// True when a realize node for the producer already encloses this subtree.
pub(crate) fn function_is_already_realized_in_stmt(func: &str, s: &Stmt) -> bool {
    match s {
        Stmt::Realize { name, body, .. } => {
            name == func || function_is_already_realized_in_stmt(func, body)
        }
        Stmt::Let { body, .. }
        | Stmt::For { body, .. }
        | Stmt::ProducerConsumer { body, .. } => function_is_already_realized_in_stmt(func, body),
        Stmt::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            function_is_already_realized_in_stmt(func, then_case)
                || else_case
                    .as_ref()
                    .is_some_and(|e| function_is_already_realized_in_stmt(func, e))
        }
        Stmt::Block(stmts) => stmts
            .iter()
            .any(|s| function_is_already_realized_in_stmt(func, s)),
        Stmt::Provide { .. } | Stmt::Assert { .. } | Stmt::Evaluate(_) => false,
    }
}

/// Build the statement computing one producer over the bounds bounds
/// inference will provide (`<name>.<arg>.min` / `.max`). Performs no
/// allocation.
pub(crate) fn build_produce(
    f: &Producer,
    env: &Environment,
    target: &Target,
    names: &mut NameGen,
) -> Result<Stmt> {
    if let Some(ext) = &f.extern_def {
        return Ok(build_extern_produce(f, ext, env, target, names));
    }
    let prefix = stage_prefix(&f.name, 0);
    build_provide_loop_nest(&f.name, &prefix, None, &f.args, &f.init, false)
}

fn buffer_var(name: &str) -> Expr {
    Expr::Var(format!("{name}.buffer"))
}

fn build_extern_produce(
    f: &Producer,
    ext: &crate::producer::ExternDefinition,
    env: &Environment,
    target: &Target,
    names: &mut NameGen,
) -> Stmt {
    let mut extern_call_args: Vec<Expr> = Vec::new();
    let mut lets: Vec<(String, Expr)> = Vec::new();
    let mut buffers_to_annotate: Vec<Expr> = Vec::new();
    let mut buffer_contents_to_annotate: Vec<Expr> = Vec::new();

    for arg in &ext.args {
        match arg {
            ExternArgument::Expr(e) => extern_call_args.push(e.clone()),
            ExternArgument::Producer(input_name) => {
                let input = env
                    .get(input_name)
                    .unwrap_or_else(|| panic!("extern input '{input_name}' is not in the environment"));
                for k in 0..input.outputs() {
                    let mut buf_name = input.name.clone();
                    if input.outputs() > 1 {
                        buf_name.push_str(&format!(".{k}"));
                    }
                    let buffer = buffer_var(&buf_name);
                    extern_call_args.push(buffer.clone());
                    buffers_to_annotate.push(buffer.clone());
                    buffer_contents_to_annotate.push(buffer);
                }
            }
            ExternArgument::Buffer { name, .. } => {
                let buffer = buffer_var(name);
                extern_call_args.push(buffer.clone());
                buffers_to_annotate.push(buffer.clone());
                buffer_contents_to_annotate.push(buffer);
            }
            ExternArgument::ImageParam { name } => {
                // The caller fills in both the handle and its contents; do
                // not annotate, or a missed initialization would be masked.
                extern_call_args.push(buffer_var(name));
            }
        }
    }

    // Output buffers. When storage and computation coincide the handles
    // injected by allocation bounds inference are reused; otherwise a
    // buffer describing just this subregion is synthesized.
    if f.store_level() == f.compute_level() {
        for j in 0..f.outputs() {
            let mut buf_name = f.name.clone();
            if f.outputs() > 1 {
                buf_name.push_str(&format!(".{j}"));
            }
            let buffer = buffer_var(&buf_name);
            extern_call_args.push(buffer.clone());
            // A temporary internal buffer: mark the record, not the
            // contents the callee is expected to fill.
            buffers_to_annotate.push(buffer);
        }
    } else {
        let mut stride_name = f.name.clone();
        if f.outputs() > 1 {
            stride_name.push_str(".0");
        }
        let stage_name = stage_prefix(&f.name, 0);
        for j in 0..f.outputs() {
            let top_left: Vec<Expr> = f
                .args
                .iter()
                .map(|arg| Expr::Var(format!("{stage_name}{arg}.min")))
                .collect();
            let host_ptr = Expr::intrinsic(
                "address_of",
                vec![Expr::call_channel(&f.name, top_left, j)],
            );

            let mut buffer_args = vec![host_ptr, f.output_types[j].zero()];
            for (k, arg) in f.args.iter().enumerate() {
                let min = Expr::Var(format!("{stage_name}{arg}.min"));
                let max = Expr::Var(format!("{stage_name}{arg}.max"));
                buffer_args.push(min.clone());
                buffer_args.push(max - min + Expr::IntImm(1));
                buffer_args.push(Expr::Var(format!("{stride_name}.stride.{k}")));
            }
            let output_buffer_t = Expr::intrinsic("create_buffer_t", buffer_args);

            let buf_name = format!("{}.{j}.tmp_buffer", f.name);
            extern_call_args.push(Expr::Var(buf_name.clone()));
            buffers_to_annotate.push(Expr::Var(buf_name.clone()));
            lets.push((buf_name, output_buffer_t));
        }
    }

    // Under the memory sanitizer, mark the buffer records (and input
    // contents) as initialized before calling out.
    let mut annotate: Option<Stmt> = None;
    if target.has_feature(Feature::Msan) {
        for buffer in &buffers_to_annotate {
            let mark = Stmt::Evaluate(Expr::extern_call(
                "halide_msan_annotate_memory_is_initialized",
                vec![buffer.clone(), Expr::intrinsic("size_of_buffer_t", vec![])],
            ));
            annotate = Stmt::sequence(annotate, Some(mark));
        }
        for buffer in &buffer_contents_to_annotate {
            let mark = Stmt::Evaluate(Expr::extern_call(
                "halide_msan_annotate_buffer_is_initialized",
                vec![buffer.clone()],
            ));
            annotate = Stmt::sequence(annotate, Some(mark));
        }
    }

    // The call itself, with its result checked.
    let call = Expr::Call {
        name: ext.name.clone(),
        args: extern_call_args,
        call_type: if ext.is_c_plus_plus {
            CallType::ExternCPlusPlus
        } else {
            CallType::Extern
        },
        value_index: 0,
    };
    let result_name = names.fresh('t');
    let result = Expr::Var(result_name.clone());
    let error = Expr::extern_call(
        EXTERN_STAGE_FAILED,
        vec![Expr::StringImm(ext.name.clone()), result.clone()],
    );
    let mut check = Stmt::Assert {
        condition: result.eq(Expr::IntImm(0)),
        message: error,
    };
    check = Stmt::let_stmt(result_name, call, check);

    for (name, value) in lets.into_iter().rev() {
        check = Stmt::let_stmt(name, value, check);
    }

    match annotate {
        Some(a) => Stmt::block(vec![a, check]),
        None => check,
    }
}

/// Loop nests for each update stage, in order.
pub(crate) fn build_update(f: &Producer) -> Result<Vec<Stmt>> {
    let mut updates = Vec::new();
    for (i, def) in f.updates.iter().enumerate() {
        let prefix = stage_prefix(&f.name, i + 1);
        updates.push(build_provide_loop_nest(
            &f.name, &prefix, None, &f.args, def, true,
        )?);
    }
    Ok(updates)
}

/// The full production of a producer: the initial stage and the merged
/// update stages.
pub(crate) fn build_production(
    f: &Producer,
    env: &Environment,
    target: &Target,
    names: &mut NameGen,
) -> Result<(Stmt, Option<Stmt>)> {
    let produce = build_produce(f, env, target, names)?;
    let updates = build_update(f)?;
    let merged = if updates.is_empty() {
        None
    } else {
        Some(Stmt::block(updates))
    };
    Ok((produce, merged))
}

/// Inject assertions checking that explicit bounds cover the inferred
/// bounds required.
pub(crate) fn inject_explicit_bounds(mut body: Stmt, f: &Producer) -> Stmt {
    for stage in 0..=f.updates.len() {
        for b in &f.schedule().bounds {
            let prefix = format!("{}{}", stage_prefix(&f.name, stage), b.var);
            let min_var = Expr::Var(format!("{prefix}.min_unbounded"));
            let max_var = Expr::Var(format!("{prefix}.max_unbounded"));
            let min_val = match &b.min {
                Some(m) => m.clone(),
                None => min_var.clone(),
            };
            let Some(extent) = &b.extent else {
                // A bounds alignment only ever expands the region computed.
                continue;
            };
            let max_val = (extent.clone() + min_val.clone()) - Expr::IntImm(1);

            let check = Expr::And(
                Box::new(min_val.clone().le(min_var.clone())),
                Box::new(max_val.clone().ge(max_var.clone())),
            );
            let error = Expr::extern_call(
                EXPLICIT_BOUNDS_TOO_SMALL,
                vec![
                    Expr::StringImm(b.var.clone()),
                    Expr::StringImm(f.name.clone()),
                    min_val,
                    max_val,
                    min_var,
                    max_var,
                ],
            );
            body = Stmt::block(vec![
                Stmt::Assert {
                    condition: check,
                    message: error,
                },
                body,
            ]);
        }
    }
    body
}

/// Wrap a consumer subtree in the realize bracket (for non-outputs) and the
/// explicit-bounds assertions.
pub(crate) fn build_realize(mut s: Stmt, f: &Producer, is_output: bool, target: &Target) -> Stmt {
    if !is_output {
        let bounds: Vec<Range> = f
            .args
            .iter()
            .map(|arg| {
                Range::new(
                    Expr::Var(format!("{}.{arg}.min_realized", f.name)),
                    Expr::Var(format!("{}.{arg}.extent_realized", f.name)),
                )
            })
            .collect();
        s = Stmt::Realize {
            name: f.name.clone(),
            types: f.output_types.clone(),
            bounds,
            condition: Expr::BoolImm(true),
            body: Box::new(s),
        };
    }
    if target.has_feature(Feature::NoAsserts) {
        s
    } else {
        inject_explicit_bounds(s, f)
    }
}

/// Mutator splicing one producer's realization into the consumer tree.
pub(crate) struct InjectRealization<'a> {
    func: &'a Producer,
    is_output: bool,
    target: &'a Target,
    env: &'a Environment,
    names: &'a mut NameGen,
    pub found_store_level: bool,
    pub found_compute_level: bool,
}

impl<'a> InjectRealization<'a> {
    pub fn new(
        func: &'a Producer,
        is_output: bool,
        target: &'a Target,
        env: &'a Environment,
        names: &'a mut NameGen,
    ) -> InjectRealization<'a> {
        InjectRealization {
            func,
            is_output,
            target,
            env,
            names,
            found_store_level: false,
            found_compute_level: false,
        }
    }

    fn build_pipeline(&mut self, consume: Stmt) -> Result<Stmt> {
        let (produce, merged_updates) = build_production(self.func, self.env, self.target, self.names)?;
        let producer = match merged_updates {
            Some(updates) => Stmt::block(vec![produce, updates]),
            None => produce,
        };
        let producer = Stmt::producer(&self.func.name, producer);
        let consumer = Stmt::consumer(&self.func.name, consume);
        Ok(Stmt::block(vec![producer, consumer]))
    }

    pub fn mutate(&mut self, s: &Stmt) -> Result<Stmt> {
        match s {
            Stmt::For { .. } => self.visit_for(s),
            Stmt::Provide { .. } => self.visit_provide(s),
            _ => map_stmt_children(s, &mut |child| self.mutate(child)),
        }
    }

    fn visit_for(&mut self, for_loop: &Stmt) -> Result<Stmt> {
        let Stmt::For {
            name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } = for_loop
        else {
            unreachable!("visit_for called on a non-loop");
        };
        debug!(producer = %self.func.name, loop_name = %name, "inject realization entering loop");

        let compute_level = self.func.compute_level().clone();
        let store_level = self.func.store_level().clone();

        // Dig through any let statements.
        let mut lets: Vec<(String, Expr)> = Vec::new();
        let mut body: &Stmt = body;
        while let Stmt::Let {
            name,
            value,
            body: inner,
        } = body
        {
            lets.push((name.clone(), value.clone()));
            body = inner;
        }

        // Extern stages cannot be scheduled inside a vectorized loop; an
        // inline extern used here gets its realization wrapped around the
        // whole loop instead.
        if self.func.has_extern_definition()
            && compute_level.is_inline()
            && *loop_type == LoopType::Vectorized
            && !function_is_already_realized_in_stmt(&self.func.name, for_loop)
            && function_is_used_in_stmt(&self.func.name, for_loop)
        {
            let pipeline = self.build_pipeline(for_loop.clone())?;
            self.found_store_level = true;
            self.found_compute_level = true;
            return Ok(build_realize(pipeline, self.func, self.is_output, self.target));
        }

        let mut body = self.mutate(body)?;

        if compute_level.matches_loop(name) {
            debug!(producer = %self.func.name, loop_name = %name, "found compute level");
            if !function_is_already_realized_in_stmt(&self.func.name, &body)
                && (function_is_used_in_stmt(&self.func.name, &body) || self.is_output)
            {
                body = self.build_pipeline(body)?;
            }
            self.found_compute_level = true;
        }

        if store_level.matches_loop(name) {
            debug!(producer = %self.func.name, loop_name = %name, "found store level");
            assert!(
                self.found_compute_level,
                "the compute loop level was not found within the store loop level"
            );
            if !function_is_already_realized_in_stmt(&self.func.name, &body)
                && (function_is_used_in_stmt(&self.func.name, &body) || self.is_output)
            {
                body = build_realize(body, self.func, self.is_output, self.target);
            }
            self.found_store_level = true;
        }

        // Reinstate the lets.
        for (name, value) in lets.into_iter().rev() {
            body = Stmt::let_stmt(name, value, body);
        }

        Ok(Stmt::For {
            name: name.clone(),
            min: min.clone(),
            extent: extent.clone(),
            loop_type: *loop_type,
            device_api: *device_api,
            body: Box::new(body),
        })
    }

    /// An inline producer with updates (or an inline extern) has no loop of
    /// its own to anchor to; realize it around the consuming store.
    fn visit_provide(&mut self, op: &Stmt) -> Result<Stmt> {
        let Stmt::Provide { name, .. } = op else {
            unreachable!("visit_provide called on a non-provide");
        };
        if *name != self.func.name
            && !self.func.is_pure()
            && self.func.compute_level().is_inline()
            && function_is_used_in_stmt(&self.func.name, op)
        {
            let pipeline = self.build_pipeline(op.clone())?;
            self.found_store_level = true;
            self.found_compute_level = true;
            Ok(build_realize(pipeline, self.func, self.is_output, self.target))
        } else {
            Ok(op.clone())
        }
    }
}

/// Delete the `__outermost` loops (whose extent is the constant one) and
/// their metadata lets, substituting mins and values through.
pub(crate) fn remove_loops_over_outermost(s: &Stmt) -> Stmt {
    match s {
        Stmt::For {
            name,
            min,
            body,
            extent,
            device_api,
            ..
        } if name.ends_with(&format!(".{OUTERMOST}"))
            && crate::simplify::simplify(extent).is_one()
            && *device_api == crate::target::DeviceApi::None =>
        {
            remove_loops_over_outermost(&substitute_in_stmt(name, min, body))
        }
        Stmt::Let { name, value, body }
            if name.ends_with(&format!(".{OUTERMOST}.loop_extent"))
                || name.ends_with(&format!(".{OUTERMOST}.loop_min"))
                || name.ends_with(&format!(".{OUTERMOST}.loop_max")) =>
        {
            let value = crate::simplify::simplify(value);
            remove_loops_over_outermost(&substitute_in_stmt(name, &value, body))
        }
        _ => {
            let result: Result<Stmt> =
                map_stmt_children(s, &mut |child| Ok(remove_loops_over_outermost(child)));
            result.expect("infallible traversal")
        }
    }
}
