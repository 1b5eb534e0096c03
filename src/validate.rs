//! # Schedule Validation
//!
//! Placement legality checks, run once per fused group and once per
//! producer immediately before its injection into the statement tree. All
//! failures are user errors carrying the producer, the offending level
//! rendered as a schedule expression, and the set of legal levels.

use tracing::warn;

use crate::error::{Error, Result};
use crate::ir::{CallType, Expr, Stmt};
use crate::names::{var_name_match, OUTERMOST, ROOT_LOOP};
use crate::producer::{Definition, Environment, ExternArgument, Producer};
use crate::schedule::LoopLevel;
use crate::target::Target;

/// A for-loop enclosing some use of the producer under validation.
#[derive(Debug, Clone)]
struct Site {
    is_parallel: bool,
    loop_name: String,
}

/// Collects, from the evolving statement tree, the loop levels at which a
/// producer may legally be placed: the intersection across use sites of
/// each site's enclosing loop sequence.
struct LegalSites<'a> {
    func: &'a str,
    stack: Vec<Site>,
    allowed: Option<Vec<Site>>,
}

impl<'a> LegalSites<'a> {
    fn new(func: &'a str) -> LegalSites<'a> {
        LegalSites {
            func,
            stack: Vec::new(),
            allowed: None,
        }
    }

    fn register_use(&mut self) {
        match &mut self.allowed {
            None => self.allowed = Some(self.stack.clone()),
            Some(allowed) => {
                let common: Vec<Site> = self
                    .stack
                    .iter()
                    .filter(|s| allowed.iter().any(|a| a.loop_name == s.loop_name))
                    .cloned()
                    .collect();
                *allowed = common;
            }
        }
    }

    fn visit_expr(&mut self, e: &Expr) {
        let mut uses = false;
        crate::ir::visit::for_each_expr(e, &mut |node| match node {
            Expr::Call {
                name,
                call_type: CallType::Producer,
                ..
            } if name == self.func => uses = true,
            Expr::Var(v) if is_buffer_ref(v, self.func) => uses = true,
            _ => {}
        });
        if uses {
            self.register_use();
        }
    }

    fn visit(&mut self, s: &Stmt) {
        match s {
            Stmt::For {
                name,
                min,
                extent,
                loop_type,
                body,
                ..
            } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                self.stack.push(Site {
                    is_parallel: loop_type.is_parallel(),
                    loop_name: name.clone(),
                });
                self.visit(body);
                self.stack.pop();
            }
            Stmt::Let { value, body, .. } => {
                self.visit_expr(value);
                self.visit(body);
            }
            Stmt::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                self.visit_expr(condition);
                self.visit(then_case);
                if let Some(e) = else_case {
                    self.visit(e);
                }
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.visit(s);
                }
            }
            Stmt::Provide { values, args, .. } => {
                for v in values {
                    self.visit_expr(v);
                }
                for a in args {
                    self.visit_expr(a);
                }
            }
            Stmt::Realize {
                bounds,
                condition,
                body,
                ..
            } => {
                for r in bounds {
                    self.visit_expr(&r.min);
                    self.visit_expr(&r.extent);
                }
                self.visit_expr(condition);
                self.visit(body);
            }
            Stmt::ProducerConsumer { body, .. } => self.visit(body),
            Stmt::Assert { condition, message } => {
                self.visit_expr(condition);
                self.visit_expr(message);
            }
            Stmt::Evaluate(e) => self.visit_expr(e),
        }
    }
}

fn is_buffer_ref(var: &str, func: &str) -> bool {
    var.starts_with(&format!("{func}.")) && var.ends_with(".buffer")
}

/// Render a placement as the schedule expression a user would have written.
pub fn schedule_to_source(func: &str, store_at: &LoopLevel, compute_at: &LoopLevel) -> String {
    let mut out = String::from(func);
    if compute_at.is_inline() {
        out.push_str(".compute_inline()");
    } else {
        if store_at != compute_at {
            match store_at {
                LoopLevel::Root => out.push_str(".store_root()"),
                LoopLevel::At { func, var, .. } => {
                    out.push_str(&format!(".store_at({func}, {var})"));
                }
                LoopLevel::Inline => {}
            }
        }
        match compute_at {
            LoopLevel::Root => out.push_str(".compute_root()"),
            LoopLevel::At { func, var, .. } => {
                out.push_str(&format!(".compute_at({func}, {var})"));
            }
            LoopLevel::Inline => {}
        }
    }
    out.push(';');
    out
}

/// A site rendered as the pair of schedule calls that would place a
/// producer there.
fn site_to_level(loop_name: &str) -> LoopLevel {
    if loop_name == ROOT_LOOP {
        return LoopLevel::Root;
    }
    // Loop names have the shape func.s<stage>.<...>.var.
    let mut parts = loop_name.split('.');
    let func = parts.next().unwrap_or_default().to_string();
    let stage = parts
        .next()
        .and_then(|s| s.strip_prefix('s'))
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| panic!("malformed loop name '{loop_name}'"));
    let var = loop_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_string();
    LoopLevel::At { func, stage, var }
}

/// Indented loop-tree excerpt showing where `func` is used, for the
/// IllegalSite diagnostic.
fn print_uses(func: &str, s: &Stmt) -> String {
    struct Printer<'a> {
        func: &'a str,
        caller: String,
        indent: usize,
        last_was_ellipsis: bool,
        out: String,
    }

    impl Printer<'_> {
        fn stmt_uses_func(&self, s: &Stmt) -> bool {
            let mut found = false;
            crate::ir::visit::for_each_stmt_expr(s, &mut |e| {
                if let Expr::Call {
                    name,
                    call_type: CallType::Producer,
                    ..
                } = e
                {
                    if name == self.func {
                        found = true;
                    }
                }
            });
            found
        }

        fn line(&mut self, text: &str) {
            for _ in 0..self.indent {
                self.out.push_str("  ");
            }
            self.out.push_str(text);
            self.out.push('\n');
        }

        fn visit(&mut self, s: &Stmt) {
            match s {
                Stmt::For { name, body, .. } => {
                    if name == ROOT_LOOP || name.ends_with(&format!(".{OUTERMOST}")) {
                        self.visit(body);
                    } else if self.stmt_uses_func(body) {
                        self.line(&format!("for {name}:"));
                        self.last_was_ellipsis = false;
                        self.indent += 1;
                        self.visit(body);
                        self.indent -= 1;
                    } else if !self.last_was_ellipsis {
                        self.line("...");
                        self.last_was_ellipsis = true;
                    }
                }
                Stmt::ProducerConsumer {
                    name,
                    is_producer: true,
                    body,
                } => {
                    let old = std::mem::replace(&mut self.caller, name.clone());
                    self.visit(body);
                    self.caller = old;
                }
                Stmt::Provide { name, values, args } => {
                    let mut uses = false;
                    for e in values.iter().chain(args.iter()) {
                        crate::ir::visit::for_each_expr(e, &mut |node| {
                            if let Expr::Call {
                                name: callee,
                                call_type: CallType::Producer,
                                ..
                            } = node
                            {
                                if callee == self.func {
                                    uses = true;
                                }
                            }
                        });
                    }
                    if uses {
                        let caller = if self.caller.is_empty() {
                            name.clone()
                        } else {
                            self.caller.clone()
                        };
                        let func = self.func;
                        self.line(&format!("{caller} uses {func}"));
                        self.last_was_ellipsis = false;
                    }
                }
                Stmt::Let { body, .. }
                | Stmt::Realize { body, .. }
                | Stmt::ProducerConsumer { body, .. } => self.visit(body),
                Stmt::IfThenElse {
                    then_case,
                    else_case,
                    ..
                } => {
                    self.visit(then_case);
                    if let Some(e) = else_case {
                        self.visit(e);
                    }
                }
                Stmt::Block(stmts) => {
                    for s in stmts {
                        self.visit(s);
                    }
                }
                Stmt::Assert { .. } | Stmt::Evaluate(_) => {}
            }
        }
    }

    let mut printer = Printer {
        func,
        caller: String::new(),
        indent: 1,
        last_was_ellipsis: false,
        out: String::new(),
    };
    printer.visit(s);
    printer.out
}

/// Validate one producer's placement against the current statement tree.
pub fn validate_schedule(
    f: &Producer,
    s: &Stmt,
    target: &Target,
    is_output: bool,
    env: &Environment,
) -> Result<()> {
    // An extern stage reads its producer inputs through whole buffers;
    // those inputs must materialize somewhere.
    if let Some(ext) = &f.extern_def {
        for arg in &ext.args {
            if let ExternArgument::Producer(input) = arg {
                if let Some(g) = env.get(input) {
                    if g.compute_level().is_inline() {
                        return Err(Error::ExternInputInline {
                            func: f.name.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
        }
    }

    // Warn when only some of the stages have been scheduled.
    let any_scheduled = f.definitions().any(|d| d.schedule.touched);
    if any_scheduled {
        for (i, def) in f.updates.iter().enumerate() {
            if !def.schedule.touched {
                warn!(
                    producer = %f.name,
                    update = i,
                    "update step has not been scheduled even though other steps have; \
                     schedule it explicitly to suppress this warning"
                );
            }
        }
    }

    // Every dim's device API must be supported, specializations included.
    let mut definitions: Vec<&Definition> = f.definitions().collect();
    let mut i = 0;
    while i < definitions.len() {
        let def = definitions[i];
        for s in &def.specializations {
            definitions.push(&s.definition);
        }
        i += 1;
    }
    for def in &definitions {
        for dim in &def.schedule.dims {
            if !target.supports_device_api(dim.device_api) {
                return Err(Error::UnsupportedDevice {
                    func: f.name.clone(),
                    device: dim.device_api.to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    let store_at = f.store_level().clone();
    let compute_at = f.compute_level().clone();

    // Outputs live in caller-provided storage: root placement only.
    if is_output {
        if store_at.is_root() && compute_at.is_root() {
            return Ok(());
        }
        return Err(Error::OutputNotRoot {
            func: f.name.clone(),
        });
    }

    if store_at.is_inline() && compute_at.is_inline() {
        if !f.init.specializations.is_empty() {
            return Err(Error::InlineWithSpecialization {
                func: f.name.clone(),
            });
        }
        return Ok(());
    }

    // Inline-and-rooted (or inline-and-placed) mixtures make no sense.
    if store_at.is_inline() != compute_at.is_inline() {
        return Err(Error::StoreOutsideCompute {
            func: f.name.clone(),
            detail: schedule_to_source(&f.name, &store_at, &compute_at),
        });
    }

    // Otherwise inspect the uses to see what is allowed.
    let mut legal = LegalSites::new(&f.name);
    legal.visit(s);
    let sites = legal.allowed.unwrap_or_default();

    let mut store_idx = None;
    let mut compute_idx = None;
    for (i, site) in sites.iter().enumerate() {
        if store_at.matches_loop(&site.loop_name) {
            store_idx = Some(i);
        }
        if compute_at.matches_loop(&site.loop_name) {
            compute_idx = Some(i);
        }
    }

    match (store_idx, compute_idx) {
        (Some(si), Some(ci)) if si <= ci => {
            // No parallel loop may sit between storage and computation.
            for site in &sites[si + 1..=ci] {
                if site.is_parallel {
                    return Err(Error::RaceBetweenStoreAndCompute {
                        func: f.name.clone(),
                        loop_level: site.loop_name.clone(),
                    });
                }
            }
            Ok(())
        }
        (Some(_), Some(_)) => Err(Error::StoreOutsideCompute {
            func: f.name.clone(),
            detail: schedule_to_source(&f.name, &store_at, &compute_at),
        }),
        _ => {
            let mut legal_text = String::new();
            for site in &sites {
                let level = site_to_level(&site.loop_name);
                legal_text.push_str(&format!(
                    "  {}\n",
                    schedule_to_source(&f.name, &level, &level)
                ));
            }
            Err(Error::IllegalSite {
                func: f.name.clone(),
                requested: schedule_to_source(&f.name, &store_at, &compute_at),
                legal: legal_text,
                uses: print_uses(&f.name, s),
            })
        }
    }
}

/// Validate every co-schedule request of every group member.
pub fn validate_fused_groups(fused_groups: &[Vec<String>], env: &Environment) -> Result<()> {
    for group in fused_groups {
        for fn_name in group {
            let producer = env
                .get(fn_name)
                .unwrap_or_else(|| panic!("fuse group member '{fn_name}' is not in the environment"));
            for (stage, def) in producer.definitions().enumerate() {
                validate_fused_pairs_of_stage(fn_name, stage, def, env)?;
            }
        }
    }
    Ok(())
}

fn validate_fused_pairs_of_stage(
    fn_name: &str,
    stage: usize,
    def_1: &Definition,
    env: &Environment,
) -> Result<()> {
    for p in &def_1.schedule.fused_pairs {
        assert!(
            p.func_1 == fn_name && p.stage_1 == stage,
            "fused pair {p:?} recorded on the wrong stage schedule"
        );

        let func_1 = &env[&p.func_1];
        let func_2 = env
            .get(&p.func_2)
            .unwrap_or_else(|| panic!("fused pair references unknown producer '{}'", p.func_2));
        let def_2 = func_2
            .definition(p.stage_2)
            .unwrap_or_else(|| panic!("fused pair references missing stage {}", p.stage_2));

        // Specializations branch through the shared outer loops, which
        // makes the co-schedule ambiguous. Both stages of the pair must be
        // free of them.
        if !def_1.specializations.is_empty() {
            return Err(Error::InvalidFuseMember {
                func: p.func_1.clone(),
                stage: p.stage_1,
                reason: format!(
                    "has {}.s{} scheduled to be computed with it, so it must not have any specializations",
                    p.func_2, p.stage_2
                ),
            });
        }
        if !def_2.specializations.is_empty() {
            return Err(Error::InvalidFuseMember {
                func: p.func_2.clone(),
                stage: p.stage_2,
                reason: format!(
                    "is scheduled to be computed with {}.s{}, so it must not have any specializations",
                    p.func_1, p.stage_1
                ),
            });
        }

        // Co-scheduled stages must emit real loops.
        for (func, stage, producer) in [
            (&p.func_1, p.stage_1, func_1),
            (&p.func_2, p.stage_2, func_2),
        ] {
            if producer.compute_level().is_inline() {
                return Err(Error::InvalidFuseMember {
                    func: func.clone(),
                    stage,
                    reason: "is scheduled inline".to_string(),
                });
            }
            if producer.has_extern_definition() {
                return Err(Error::InvalidFuseMember {
                    func: func.clone(),
                    stage,
                    reason: "has an extern definition".to_string(),
                });
            }
        }

        // The shared var must exist in both stages' dim lists.
        let dims_1 = &def_1.schedule.dims;
        let dims_2 = &def_2.schedule.dims;
        let start_1 = dims_1
            .iter()
            .position(|d| var_name_match(&d.var, &p.var_name))
            .ok_or_else(|| Error::MismatchedFusedDims {
                detail: format!(
                    "cannot find {} in {}.s{}",
                    p.var_name, p.func_1, p.stage_1
                ),
            })?;
        let start_2 = dims_2
            .iter()
            .position(|d| var_name_match(&d.var, &p.var_name))
            .ok_or_else(|| Error::MismatchedFusedDims {
                detail: format!(
                    "cannot find {} in {}.s{}",
                    p.var_name, p.func_2, p.stage_2
                ),
            })?;

        // The dims from the shared var outward must agree pointwise.
        let n_fused_1 = dims_1.len() - start_1;
        let n_fused_2 = dims_2.len() - start_2;
        if n_fused_1 != n_fused_2 {
            return Err(Error::MismatchedFusedDims {
                detail: format!(
                    "number of fused dims of {}.s{} and {}.s{} do not match",
                    p.func_1, p.stage_1, p.func_2, p.stage_2
                ),
            });
        }
        for i in 0..n_fused_1 {
            if dims_1[start_1 + i] != dims_2[start_2 + i] {
                return Err(Error::MismatchedFusedDims {
                    detail: format!(
                        "dims {} of {}.s{} ({}) and {}.s{} ({}) do not match",
                        i,
                        p.func_1,
                        p.stage_1,
                        dims_1[start_1 + i].var,
                        p.func_2,
                        p.stage_2,
                        dims_2[start_2 + i].var
                    ),
                });
            }
        }

        // Distinct producers must agree on where the group is computed;
        // intra-producer stage fusion is exempt.
        if p.func_1 != p.func_2 && func_1.compute_level() != func_2.compute_level() {
            return Err(Error::MismatchedComputeLevel {
                func_1: p.func_1.clone(),
                stage_1: p.stage_1,
                level_1: func_1.compute_level().describe(),
                func_2: p.func_2.clone(),
                stage_2: p.stage_2,
                level_2: func_2.compute_level().describe(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::LoopLevel;

    #[test]
    fn schedule_source_rendering() {
        assert_eq!(
            schedule_to_source("f", &LoopLevel::Root, &LoopLevel::Root),
            "f.compute_root();"
        );
        assert_eq!(
            schedule_to_source("f", &LoopLevel::Inline, &LoopLevel::Inline),
            "f.compute_inline();"
        );
        assert_eq!(
            schedule_to_source(
                "f",
                &LoopLevel::Root,
                &LoopLevel::at("g", 0, "y")
            ),
            "f.store_root().compute_at(g, y);"
        );
    }

    #[test]
    fn site_parsing_round_trips() {
        assert_eq!(site_to_level(ROOT_LOOP), LoopLevel::Root);
        assert_eq!(site_to_level("f.s0.x"), LoopLevel::at("f", 0, "x"));
        assert_eq!(site_to_level("f.s1.fused.x"), LoopLevel::at("f", 1, "x"));
    }
}
