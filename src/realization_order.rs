//! # Realization Ordering
//!
//! Produces the evaluation order of all producers reachable from the
//! outputs (callee before caller) plus the partition of that order into
//! fuse groups. Co-schedule requests add synthetic prerequisites so a fuse
//! parent is realized before the stages fused into it, and the partition is
//! rejected when the order would interleave members of different groups.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::call_graph::{all_transitive_calls, direct_calls};
use crate::error::{Error, Result};
use crate::producer::Environment;
use crate::schedule::FusedPair;

/// The scheduler's evaluation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizationOrder {
    /// All reachable producers, callee before caller.
    pub order: Vec<String>,
    /// Contiguous partition of `order` into fuse groups, each group's
    /// members in realization order.
    pub fused_groups: Vec<Vec<String>>,
}

/// Union-find over producer names.
struct DisjointSets {
    parent: BTreeMap<String, String>,
}

impl DisjointSets {
    fn new() -> DisjointSets {
        DisjointSets {
            parent: BTreeMap::new(),
        }
    }

    fn find(&mut self, x: &str) -> String {
        let p = match self.parent.get(x) {
            Some(p) => p.clone(),
            None => {
                self.parent.insert(x.to_string(), x.to_string());
                return x.to_string();
            }
        };
        if p == x {
            return p;
        }
        let root = self.find(&p);
        self.parent.insert(x.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Deterministic representative: the lexicographically smaller
            // root wins.
            if ra < rb {
                self.parent.insert(rb, ra);
            } else {
                self.parent.insert(ra, rb);
            }
        }
    }
}

/// Compute the realization order and fuse groups for the given outputs.
pub fn realization_order(outputs: &[String], env: &Environment) -> Result<RealizationOrder> {
    // Transitive callees of everything; this also rejects cyclic pipelines
    // early.
    let transitive = all_transitive_calls(env)?;

    // Direct-call DAG restricted to the environment, plus the synthetic
    // prerequisites induced by co-scheduling.
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, producer) in env {
        let callees: Vec<String> = direct_calls(producer)
            .into_iter()
            .filter(|c| env.contains_key(c))
            .collect();
        graph.insert(name.clone(), callees);
    }

    // Scan every stage schedule for co-schedule requests.
    let mut pairs_by_parent: BTreeMap<String, Vec<FusedPair>> = BTreeMap::new();
    let mut fuse_sets = DisjointSets::new();
    let mut fused_names: BTreeSet<String> = BTreeSet::new();
    for (name, producer) in env {
        let recorded = pairs_by_parent.entry(name.clone()).or_default();
        for def in producer.definitions() {
            for pair in &def.schedule.fused_pairs {
                if !env.contains_key(&pair.func_2) {
                    // Nothing realizes the child, so the request is moot.
                    continue;
                }
                if recorded.contains(pair) {
                    return Err(Error::DuplicateFusedPair {
                        func_1: pair.func_1.clone(),
                        stage_1: pair.stage_1,
                        func_2: pair.func_2.clone(),
                        stage_2: pair.stage_2,
                        var: pair.var_name.clone(),
                    });
                }
                if pair.func_1 != pair.func_2 {
                    let one_calls_other = transitive
                        .get(&pair.func_1)
                        .is_some_and(|s| s.contains(&pair.func_2))
                        || transitive
                            .get(&pair.func_2)
                            .is_some_and(|s| s.contains(&pair.func_1));
                    if one_calls_other {
                        return Err(Error::FuseDependencyCycle {
                            func_1: pair.func_1.clone(),
                            func_2: pair.func_2.clone(),
                        });
                    }
                }
                fuse_sets.union(&pair.func_1, &pair.func_2);
                fused_names.insert(pair.func_1.clone());
                fused_names.insert(pair.func_2.clone());
                recorded.push(pair.clone());

                // The parent's nest is the skeleton the child is injected
                // into, so the parent must be realized first: treat it as a
                // prerequisite of the child.
                let deps = graph.entry(pair.func_2.clone()).or_default();
                if !deps.contains(&pair.func_1) {
                    deps.push(pair.func_1.clone());
                }
            }
        }
    }

    // Mutual compute_with requests cannot both hold.
    for pairs in pairs_by_parent.values() {
        for pair in pairs {
            if pair.func_1 == pair.func_2 {
                // Fusion among stages of one producer is fine.
                continue;
            }
            if let Some(other_pairs) = pairs_by_parent.get(&pair.func_2) {
                let reversed = other_pairs
                    .iter()
                    .any(|o| o.func_1 == pair.func_2 && o.func_2 == pair.func_1);
                if reversed {
                    return Err(Error::FusedPairCycle {
                        func_1: pair.func_1.clone(),
                        func_2: pair.func_2.clone(),
                    });
                }
            }
        }
    }

    // Depth-first postorder from the outputs, callees first.
    let mut order = Vec::new();
    let mut state: BTreeMap<String, Color> = BTreeMap::new();
    for output in outputs {
        assert!(
            env.contains_key(output),
            "output '{output}' is not in the environment"
        );
        dfs(output, &graph, &mut state, &mut order)?;
    }
    debug!(order = ?order, "realization order");

    // Partition into contiguous fuse groups.
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut closed: BTreeSet<String> = BTreeSet::new();
    let mut current_root: Option<String> = None;
    for name in &order {
        let root = fuse_sets.find(name);
        match &current_root {
            Some(r) if *r == root => {
                groups
                    .last_mut()
                    .expect("a group is open whenever current_root is set")
                    .push(name.clone());
            }
            _ => {
                if let Some(r) = current_root.take() {
                    closed.insert(r);
                }
                if closed.contains(&root) {
                    return Err(Error::NonContiguousFuseGroup { func: name.clone() });
                }
                groups.push(vec![name.clone()]);
                current_root = Some(root);
            }
        }
    }
    debug!(groups = ?groups, "fuse groups");

    Ok(RealizationOrder {
        order,
        fused_groups: groups,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Grey,
    Black,
}

fn dfs(
    current: &str,
    graph: &BTreeMap<String, Vec<String>>,
    state: &mut BTreeMap<String, Color>,
    order: &mut Vec<String>,
) -> Result<()> {
    match state.get(current) {
        Some(Color::Black) => return Ok(()),
        Some(Color::Grey) => {
            return Err(Error::CyclicPipeline {
                func: current.to_string(),
            })
        }
        None => {}
    }
    state.insert(current.to_string(), Color::Grey);
    if let Some(callees) = graph.get(current) {
        for callee in callees {
            if callee == current {
                // Self-loops on update stages are exempt.
                continue;
            }
            dfs(callee, graph, state, order)?;
        }
    }
    state.insert(current.to_string(), Color::Black);
    order.push(current.to_string());
    Ok(())
}
