//! # Producer Records
//!
//! A producer is a named pure array-valued function: one initial definition,
//! zero or more update definitions, and optionally an extern attribute
//! (computed by calling an external routine instead of by an expression).
//! Producers are created by the front end and frozen before ordering; all
//! cross-references are names resolved through the [`Environment`].

use std::collections::BTreeMap;

use crate::ir::{Expr, ScalarType};
use crate::schedule::{Dim, LoopLevel, ReductionVariable, StageSchedule};

/// The immutable map of producers a compilation runs over. `BTreeMap` keeps
/// every iteration deterministic.
pub type Environment = BTreeMap<String, Producer>;

/// Build an environment from a list of producers.
pub fn environment(producers: Vec<Producer>) -> Environment {
    producers.into_iter().map(|p| (p.name.clone(), p)).collect()
}

/// A set of reduction variables with optional predicates restricting the
/// sites they touch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReductionDomain {
    pub vars: Vec<ReductionVariable>,
    pub predicates: Vec<Expr>,
}

impl ReductionDomain {
    pub fn new(vars: Vec<(String, Expr, Expr)>) -> ReductionDomain {
        ReductionDomain {
            vars: vars
                .into_iter()
                .map(|(var, min, extent)| ReductionVariable { var, min, extent })
                .collect(),
            predicates: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Expr) -> ReductionDomain {
        self.predicates.push(predicate);
        self
    }
}

/// A condition plus a nested definition taking over when it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Specialization {
    pub condition: Expr,
    pub definition: Definition,
}

/// One stage of a producer: stage 0 is the initial definition, stage k is
/// update k-1.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// Index expressions for writing, one per pure arg.
    pub args: Vec<Expr>,
    /// Right-hand sides, one per output channel.
    pub values: Vec<Expr>,
    pub rdom: Option<ReductionDomain>,
    pub specializations: Vec<Specialization>,
    pub schedule: StageSchedule,
    pub is_init: bool,
}

impl Definition {
    /// The reduction-domain predicates guarding this stage's writes.
    pub fn split_predicate(&self) -> Vec<Expr> {
        self.rdom
            .as_ref()
            .map(|r| r.predicates.clone())
            .unwrap_or_default()
    }
}

/// One argument of an extern stage's call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternArgument {
    /// A scalar expression passed through.
    Expr(Expr),
    /// A producer input: one buffer handle per output channel.
    Producer(String),
    /// A buffer bound at compile time.
    Buffer { name: String, dimensions: usize },
    /// An image parameter resolved from the environment at run time.
    ImageParam { name: String },
}

/// The extern attribute of a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternDefinition {
    pub name: String,
    pub args: Vec<ExternArgument>,
    pub is_c_plus_plus: bool,
}

/// A named pure array-valued function.
#[derive(Debug, Clone, PartialEq)]
pub struct Producer {
    pub name: String,
    /// Pure dimension names, in order.
    pub args: Vec<String>,
    pub init: Definition,
    pub updates: Vec<Definition>,
    pub output_types: Vec<ScalarType>,
    pub extern_def: Option<ExternDefinition>,
}

impl Producer {
    /// Define a producer over the given pure args with one value per output
    /// channel. Output types default to `Int32` per channel.
    pub fn define(name: impl Into<String>, args: &[&str], values: Vec<Expr>) -> Producer {
        let name = name.into();
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let schedule = StageSchedule::with_dims(args.iter().cloned());
        let output_types = vec![ScalarType::Int32; values.len()];
        Producer {
            name,
            init: Definition {
                args: args.iter().map(|a| Expr::var(a.clone())).collect(),
                values,
                rdom: None,
                specializations: Vec::new(),
                schedule,
                is_init: true,
            },
            args,
            updates: Vec::new(),
            output_types,
            extern_def: None,
        }
    }

    pub fn with_output_types(mut self, types: Vec<ScalarType>) -> Producer {
        assert_eq!(
            types.len(),
            self.init.values.len(),
            "one output type per channel"
        );
        self.output_types = types;
        self
    }

    /// Mark this producer as computed by an external routine.
    pub fn with_extern(
        mut self,
        name: impl Into<String>,
        args: Vec<ExternArgument>,
        is_c_plus_plus: bool,
    ) -> Producer {
        self.extern_def = Some(ExternDefinition {
            name: name.into(),
            args,
            is_c_plus_plus,
        });
        self
    }

    /// Append an update definition. Its loop axes are the pure variables
    /// among the store args (in arg order), then the reduction variables
    /// outside of those, then the sentinel.
    pub fn define_update(
        &mut self,
        args: Vec<Expr>,
        values: Vec<Expr>,
        rdom: Option<ReductionDomain>,
    ) {
        assert_eq!(args.len(), self.args.len(), "one store index per pure arg");
        let mut dims: Vec<Dim> = Vec::new();
        for (site, pure_name) in args.iter().zip(&self.args) {
            if let Expr::Var(v) = site {
                if v == pure_name {
                    dims.push(Dim::serial(v.clone()));
                }
            }
        }
        let mut rvars = Vec::new();
        if let Some(dom) = &rdom {
            for rv in &dom.vars {
                dims.push(Dim::serial_rvar(rv.var.clone()));
            }
            rvars = dom.vars.clone();
        }
        dims.push(Dim::serial(crate::names::OUTERMOST));
        let mut schedule = StageSchedule::with_dims(std::iter::empty());
        schedule.dims = dims;
        schedule.rvars = rvars;
        self.updates.push(Definition {
            args,
            values,
            rdom,
            specializations: Vec::new(),
            schedule,
            is_init: false,
        });
    }

    /// Add a specialization to the initial definition: when `condition`
    /// holds, the same values are computed under an independently
    /// schedulable copy of the definition.
    pub fn specialize(&mut self, condition: Expr) {
        let mut definition = self.init.clone();
        definition.specializations.clear();
        self.init.specializations.push(Specialization {
            condition,
            definition,
        });
    }

    /// Number of output channels.
    pub fn outputs(&self) -> usize {
        self.init.values.len().max(1)
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn has_extern_definition(&self) -> bool {
        self.extern_def.is_some()
    }

    /// Pure producers have a single (initial) definition and no extern
    /// attribute.
    pub fn is_pure(&self) -> bool {
        !self.has_updates() && !self.has_extern_definition()
    }

    /// Whether inline substitution of this producer is possible.
    pub fn can_be_inlined(&self) -> bool {
        self.is_pure() && !self.init.values.is_empty()
    }

    /// The placement schedule: stage 0's record.
    pub fn schedule(&self) -> &StageSchedule {
        &self.init.schedule
    }

    pub fn compute_level(&self) -> &LoopLevel {
        &self.init.schedule.compute_level
    }

    pub fn store_level(&self) -> &LoopLevel {
        &self.init.schedule.store_level
    }

    /// The definition of a stage: 0 is the initial definition, k is
    /// update k-1.
    pub fn definition(&self, stage: usize) -> Option<&Definition> {
        if stage == 0 {
            Some(&self.init)
        } else {
            self.updates.get(stage - 1)
        }
    }

    pub fn stage_schedule_mut(&mut self, stage: usize) -> Option<&mut StageSchedule> {
        if stage == 0 {
            Some(&mut self.init.schedule)
        } else {
            self.updates.get_mut(stage - 1).map(|d| &mut d.schedule)
        }
    }

    /// All definitions: the initial one, then updates in order.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        std::iter::once(&self.init).chain(self.updates.iter())
    }
}
