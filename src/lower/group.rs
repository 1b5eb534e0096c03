//! # Fused-Group Injection
//!
//! Splices a group of co-scheduled producers into the consumer tree as one
//! unit: each member's stages are built and injected at their fuse levels
//! into a group-local produce statement, the shared loops are renamed to
//! `<parent>.s<k>.fused.<dim>` and bound to the union of every
//! participant's bounds, and the fused dims of the children collapse to a
//! single point driven by the parent's loop variables.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::Result;
use crate::ir::substitute::substitute_in_stmt;
use crate::ir::visit::map_stmt_children;
use crate::ir::{max, min, Expr, Stmt};
use crate::names::{stage_prefix, var_name_match, NameGen};
use crate::producer::{Definition, Environment, Producer};
use crate::schedule::{FusedPair, LoopLevel};
use crate::simplify::simplify;
use crate::target::Target;

use super::inject::{build_realize, function_is_used_in_stmt};
use super::loop_nest::build_provide_loop_nest;

type BoundsMap = BTreeMap<String, Option<Expr>>;
type Replacements = BTreeMap<String, Expr>;

/// Mutator splicing a whole fuse group into the consumer tree.
pub(crate) struct InjectGroupRealization<'a> {
    group: Vec<&'a Producer>,
    is_output_list: Vec<bool>,
    target: &'a Target,
    env: &'a Environment,
    compute_level: LoopLevel,
    store_level: LoopLevel,
    pub found_store_level: bool,
    pub found_compute_level: bool,
}

impl<'a> InjectGroupRealization<'a> {
    pub fn new(
        group: Vec<&'a Producer>,
        is_output_list: Vec<bool>,
        target: &'a Target,
        env: &'a Environment,
        _names: &mut NameGen,
    ) -> InjectGroupRealization<'a> {
        assert!(!group.is_empty(), "fuse groups have at least one member");
        assert_eq!(group.len(), is_output_list.len());
        let compute_level = group[0].compute_level().clone();
        let store_level = group[0].store_level().clone();
        assert!(
            !compute_level.is_inline(),
            "validation admits no inline member into a fuse group"
        );
        InjectGroupRealization {
            group,
            is_output_list,
            target,
            env,
            compute_level,
            store_level,
            found_store_level: false,
            found_compute_level: false,
        }
    }

    pub fn mutate(&mut self, s: &Stmt) -> Result<Stmt> {
        match s {
            Stmt::For { .. } => self.visit_for(s),
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

        let mut body = self.mutate(body)?;

        if self.compute_level.matches_loop(name) {
            debug!(loop_name = %name, "found group compute level");
            body = self.build_pipeline_group(body)?;
            self.found_compute_level = true;
        }

        if self.store_level.matches_loop(name) {
            debug!(loop_name = %name, "found group store level");
            assert!(
                self.found_compute_level,
                "the compute loop level was not found within the store loop level"
            );
            body = self.build_realize_group(body);
            self.found_store_level = true;
        }

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

    fn build_pipeline_group(&mut self, consume: Stmt) -> Result<Stmt> {
        // Members neither used downstream nor output are skipped entirely.
        let skip: Vec<bool> = self
            .group
            .iter()
            .zip(&self.is_output_list)
            .map(|(f, &is_output)| !(function_is_used_in_stmt(&f.name, &consume) || is_output))
            .collect();

        // Consumer markers, innermost member last.
        let mut consume = consume;
        for f in self.group.iter().rev() {
            consume = Stmt::consumer(&f.name, consume);
        }

        // Build each member's stages, injecting them at their fuse levels.
        // `bounds` captures every registered loop bound let seen along the
        // way; `replacements` collapses each child's fused loops onto the
        // parent's loop variables.
        let mut bounds: BoundsMap = BTreeMap::new();
        let mut replacements: Replacements = BTreeMap::new();

        let mut produce: Option<Stmt> = None;
        for (f, skipped) in self.group.iter().zip(&skip) {
            if !skipped {
                produce = self.build_produce_func(f, produce, &mut bounds, &mut replacements)?;
            }
        }
        let produce = produce.expect("a fuse group realizes at least one member");

        let mut produce = extract_bounds(produce, &mut bounds, &replacements);

        // Replace the parent's loops with the union of all participants'
        // bounds. Bounds are taken from group member 0's initial
        // definition only.
        produce = replace_with_union_bound(self.group[0], produce, &mut bounds, self.env);

        // Producer markers, outermost member first.
        for f in self.group.iter().rev() {
            produce = Stmt::producer(&f.name, produce);
        }

        Ok(Stmt::block(vec![produce, consume]))
    }

    fn build_produce_func(
        &self,
        f: &Producer,
        mut produce: Option<Stmt>,
        bounds: &mut BoundsMap,
        replacements: &mut Replacements,
    ) -> Result<Option<Stmt>> {
        for (stage, def) in f.definitions().enumerate() {
            let prefix = stage_prefix(&f.name, stage);
            let built =
                build_produce_definition(f, &prefix, def, stage > 0, bounds, replacements)?;
            produce = Some(inject_stmt(produce, built, &def.schedule.fuse_level));
        }
        Ok(produce)
    }

    fn build_realize_group(&self, mut s: Stmt) -> Stmt {
        for (f, &is_output) in self.group.iter().zip(&self.is_output_list).rev() {
            if function_is_used_in_stmt(&f.name, &s) || is_output {
                s = build_realize(s, f, is_output, self.target);
            }
        }
        s
    }
}

/// Inject `injected` into `root` at the given loop level. Inline and root
/// levels sequence the two statements; otherwise the loop realizing the
/// level takes the injected statement at the end of its body.
fn inject_stmt(root: Option<Stmt>, injected: Stmt, level: &LoopLevel) -> Stmt {
    let Some(root) = root else {
        return injected;
    };
    if level.is_inline() || level.is_root() {
        return Stmt::block(vec![root, injected]);
    }
    let mut found = false;
    let out = inject_at_level(&root, &injected, level, &mut found);
    assert!(
        found,
        "fuse level {} not found in the group produce statement",
        level.describe()
    );
    out
}

fn inject_at_level(s: &Stmt, injected: &Stmt, level: &LoopLevel, found: &mut bool) -> Stmt {
    match s {
        Stmt::For {
            name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } => {
            let mut body = inject_at_level(body, injected, level, found);
            if level.matches_loop(name) {
                *found = true;
                body = Stmt::block(vec![body, injected.clone()]);
            }
            Stmt::For {
                name: name.clone(),
                min: min.clone(),
                extent: extent.clone(),
                loop_type: *loop_type,
                device_api: *device_api,
                body: Box::new(body),
            }
        }
        _ => {
            let result: Result<Stmt> = map_stmt_children(s, &mut |child| {
                Ok(inject_at_level(child, injected, level, found))
            });
            result.expect("infallible traversal")
        }
    }
}

/// Build one stage's loop nest for group injection, registering the bound
/// variables the later union pass needs and the replacements collapsing
/// fused child loops onto the parent's vars.
fn build_produce_definition(
    f: &Producer,
    prefix: &str,
    def: &Definition,
    is_update: bool,
    bounds: &mut BoundsMap,
    replacements: &mut Replacements,
) -> Result<Stmt> {
    let dims = &def.schedule.dims;
    let fuse_level = &def.schedule.fuse_level;

    let mut start_fuse = dims.len();
    if let LoopLevel::At { var, .. } = fuse_level {
        let pos = dims
            .iter()
            .position(|d| var_name_match(&d.var, var))
            .unwrap_or_else(|| panic!("fuse level var '{var}' not found in dims of {prefix}"));
        start_fuse = pos;
    }

    // The loop bounds become the union of this stage's bounds with those of
    // whatever stages are fused into it.
    let mut add_lets: Vec<(String, Expr)> = Vec::new();
    for pair in &def.schedule.fused_pairs {
        let pos = dims
            .iter()
            .position(|d| var_name_match(&d.var, &pair.var_name))
            .unwrap_or_else(|| {
                panic!(
                    "fused pair var '{}' not found in dims of {prefix}",
                    pair.var_name
                )
            });
        start_fuse = start_fuse.min(pos);

        // Ignore the sentinel dim throughout.
        for dim in dims.iter().take(dims.len() - 1).skip(pos) {
            let var_2 = format!("{}.s{}.{}", pair.func_2, pair.stage_2, dim.var);
            bounds.entry(format!("{var_2}.loop_min")).or_insert(None);
            bounds.entry(format!("{var_2}.loop_max")).or_insert(None);
            bounds.entry(format!("{var_2}.loop_extent")).or_insert(None);

            let var_orig = format!("{}.s{}.{}", pair.func_1, pair.stage_1, dim.var);
            let val = Expr::Var(var_orig.clone());
            replacements
                .entry(format!("{var_2}.loop_min"))
                .or_insert_with(|| val.clone());
            replacements
                .entry(format!("{var_2}.loop_max"))
                .or_insert_with(|| val.clone());
            replacements
                .entry(format!("{var_2}.loop_extent"))
                .or_insert(Expr::IntImm(1));

            bounds.entry(format!("{var_orig}.loop_min")).or_insert(None);
            bounds.entry(format!("{var_orig}.loop_max")).or_insert(None);
            bounds
                .entry(format!("{var_orig}.loop_extent"))
                .or_insert(None);
        }

        // Pure dims below the fused range may still be referred to by the
        // union when a split is involved; bind their bounds explicitly.
        for var_name in &f.args {
            let pos = dims.iter().position(|d| var_name_match(&d.var, var_name));
            let below_fuse = match pos {
                None => true,
                Some(p) => p < start_fuse,
            };
            if below_fuse {
                let var = format!("{}.s{}.{}", pair.func_2, pair.stage_2, var_name);
                let max = Expr::Var(format!("{var}.max"));
                let min_v = Expr::Var(format!("{var}.min"));
                add_lets.push((
                    format!("{var}.loop_extent"),
                    (max.clone() + Expr::IntImm(1)) - min_v.clone(),
                ));
                add_lets.push((format!("{var}.loop_min"), min_v));
                add_lets.push((format!("{var}.loop_max"), max));
            }
        }
    }

    let start_fuse = if start_fuse < dims.len() {
        Some(start_fuse)
    } else {
        None
    };
    let mut produce = build_provide_loop_nest(&f.name, prefix, start_fuse, &f.args, def, is_update)?;

    for (name, value) in add_lets {
        produce = Stmt::let_stmt(name, value, produce);
    }

    Ok(produce)
}

/// Walk the produce statement: record the value of every registered bounds
/// let, and rename each loop whose min and extent both have replacement
/// entries to its `.fused.` form bound to the replacement bounds.
fn extract_bounds(s: Stmt, bounds: &mut BoundsMap, replacements: &Replacements) -> Stmt {
    match &s {
        Stmt::Let { name, value, body } => {
            if let Some(slot) = bounds.get_mut(name) {
                *slot = Some(value.clone());
            }
            Stmt::Let {
                name: name.clone(),
                value: value.clone(),
                body: Box::new(extract_bounds((**body).clone(), bounds, replacements)),
            }
        }
        Stmt::For {
            name,
            min,
            extent,
            loop_type,
            device_api,
            body,
        } => {
            let replacement = match (min, extent) {
                (Expr::Var(min_var), Expr::Var(extent_var)) => {
                    match (replacements.get(min_var), replacements.get(extent_var)) {
                        (Some(min_val), Some(extent_val)) => {
                            Some((min_val.clone(), extent_val.clone()))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };

            let body = extract_bounds((**body).clone(), bounds, replacements);
            match replacement {
                None => Stmt::For {
                    name: name.clone(),
                    min: min.clone(),
                    extent: extent.clone(),
                    loop_type: *loop_type,
                    device_api: *device_api,
                    body: Box::new(body),
                },
                Some((min_val, extent_val)) => {
                    let last_dot = name
                        .rfind('.')
                        .unwrap_or_else(|| panic!("loop name '{name}' has no dim suffix"));
                    let new_var =
                        format!("{}.fused.{}", &name[..last_dot], &name[last_dot + 1..]);

                    let mut stmt = Stmt::For {
                        name: new_var.clone(),
                        min: Expr::Var(format!("{new_var}.loop_min")),
                        extent: Expr::Var(format!("{new_var}.loop_extent")),
                        loop_type: *loop_type,
                        device_api: *device_api,
                        body: Box::new(body),
                    };
                    stmt = Stmt::let_stmt(
                        format!("{new_var}.loop_max"),
                        simplify(&(min_val.clone() + extent_val.clone() - Expr::IntImm(1))),
                        stmt,
                    );
                    stmt = Stmt::let_stmt(format!("{new_var}.loop_min"), min_val, stmt);
                    stmt = Stmt::let_stmt(format!("{new_var}.loop_extent"), extent_val, stmt);

                    substitute_in_stmt(name, &Expr::Var(new_var), &stmt)
                }
            }
        }
        _ => {
            let result: Result<Stmt> = map_stmt_children(&s, &mut |child| {
                Ok(extract_bounds(child.clone(), bounds, replacements))
            });
            result.expect("infallible traversal")
        }
    }
}

/// Transitive dependence among fused pairs: if A is co-scheduled with B and
/// B with C on the shared dims, A inherits the relation to C.
fn collect_all_dependence(def: &Definition, env: &Environment) -> Vec<FusedPair> {
    fn helper(
        prefix: &str,
        def: &Definition,
        pair: &FusedPair,
        env: &Environment,
        dependence: &mut Vec<FusedPair>,
        visited: &mut BTreeSet<String>,
    ) {
        visited.insert(prefix.to_string());
        dependence.push(pair.clone());
        for next in &def.schedule.fused_pairs {
            let prefix_2 = format!("{}.s{}.{}", next.func_2, next.stage_2, next.var_name);
            if !visited.contains(&prefix_2) {
                let f = &env[&next.func_2];
                let def_2 = f
                    .definition(next.stage_2)
                    .unwrap_or_else(|| panic!("fused pair references missing stage {}", next.stage_2));
                helper(&prefix_2, def_2, next, env, dependence, visited);
            }
        }
    }

    let mut visited = BTreeSet::new();
    let mut dependence = Vec::new();
    for pair in &def.schedule.fused_pairs {
        let prefix = format!("{}.s{}.{}", pair.func_2, pair.stage_2, pair.var_name);
        if !visited.contains(&prefix) {
            let f = &env[&pair.func_2];
            let def_2 = f
                .definition(pair.stage_2)
                .unwrap_or_else(|| panic!("fused pair references missing stage {}", pair.stage_2));
            helper(&prefix, def_2, pair, env, &mut dependence, &mut visited);
        }
    }
    dependence
}

/// Replace the parent's fused loops with the union of every transitively
/// co-scheduled participant's bounds, and collapse the children's bound
/// entries onto the renamed fused vars.
fn replace_with_union_bound(
    f: &Producer,
    produce: Stmt,
    bounds: &mut BoundsMap,
    env: &Environment,
) -> Stmt {
    let prefix = format!("{}.s0", f.name);
    replace_with_union_bound_definition(f, &prefix, &f.init, produce, bounds, env)
}

fn captured(bounds: &BoundsMap, key: &str) -> Expr {
    bounds
        .get(key)
        .unwrap_or_else(|| panic!("bound '{key}' was never registered"))
        .clone()
        .unwrap_or_else(|| panic!("bound '{key}' was never captured from the produce statement"))
}

fn replace_with_union_bound_definition(
    _f: &Producer,
    prefix: &str,
    def: &Definition,
    produce: Stmt,
    bounds: &mut BoundsMap,
    env: &Environment,
) -> Stmt {
    let dims = &def.schedule.dims;
    let mut replacements: Replacements = BTreeMap::new();

    let dependence = collect_all_dependence(def, env);

    for pair in &dependence {
        let pos = dims
            .iter()
            .position(|d| var_name_match(&d.var, &pair.var_name))
            .unwrap_or_else(|| {
                panic!(
                    "fused pair var '{}' not found in dims of {prefix}",
                    pair.var_name
                )
            });
        for dim in dims.iter().take(dims.len() - 1).skip(pos) {
            let var_2 = format!("{}.s{}.{}", pair.func_2, pair.stage_2, dim.var);
            let min_2 = captured(bounds, &format!("{var_2}.loop_min"));
            let max_2 = captured(bounds, &format!("{var_2}.loop_max"));

            let var_1 = format!("{prefix}.{}", dim.var);
            let (min_1, max_1) = match replacements.get(&format!("{var_1}.loop_min")) {
                None => (
                    captured(bounds, &format!("{var_1}.loop_min")),
                    captured(bounds, &format!("{var_1}.loop_max")),
                ),
                Some(_) => (
                    replacements[&format!("{var_1}.loop_min")].clone(),
                    replacements[&format!("{var_1}.loop_max")].clone(),
                ),
            };

            let new_min = simplify(&min(min_1, min_2));
            let new_max = simplify(&max(max_1, max_2));
            let new_extent =
                simplify(&((new_max.clone() + Expr::IntImm(1)) - new_min.clone()));
            replacements.insert(format!("{var_1}.loop_min"), new_min);
            replacements.insert(format!("{var_1}.loop_max"), new_max);
            replacements.insert(format!("{var_1}.loop_extent"), new_extent);
        }
    }

    // The children's bound entries now refer to single points on the
    // renamed fused loops.
    for pair in &def.schedule.fused_pairs {
        let pos = dims
            .iter()
            .position(|d| var_name_match(&d.var, &pair.var_name))
            .unwrap_or_else(|| {
                panic!(
                    "fused pair var '{}' not found in dims of {prefix}",
                    pair.var_name
                )
            });
        for dim in dims.iter().take(dims.len() - 1).skip(pos) {
            let var_2 = format!("{}.s{}.{}", pair.func_2, pair.stage_2, dim.var);
            assert!(
                bounds.contains_key(&format!("{var_2}.loop_min")),
                "bound '{var_2}.loop_min' was never registered"
            );

            let var_1 = format!("{}.s{}.fused.{}", pair.func_1, pair.stage_1, dim.var);
            let val = Expr::Var(var_1);
            bounds.insert(format!("{var_2}.loop_min"), Some(val.clone()));
            bounds.insert(format!("{var_2}.loop_max"), Some(val));
            bounds.insert(format!("{var_2}.loop_extent"), Some(Expr::IntImm(1)));
        }
    }

    let mut empty_bounds: BoundsMap = BTreeMap::new();
    extract_bounds(produce, &mut empty_bounds, &replacements)
}
