//! # Arrayloom Scheduling Middle-End
//!
//! The scheduling phase of a compiler for an image-processing DSL:
//! pipelines of pure array-valued producers, each carrying a user-supplied
//! schedule (loop transformations and placement directives), are lowered to
//! a single imperative statement tree handed to downstream passes (bounds
//! inference, storage flattening, vectorization, codegen).
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Producer environment + outputs + target
//!     |
//! [Call-graph analysis]    -> direct/transitive callees, cycle rejection
//!     |
//! [Realization ordering]   -> evaluation order + fuse groups
//!     |
//! [Schedule validation]    -> placement legality per producer and group
//!     |
//! [Loop-nest synthesis]    -> per-stage nests (splits, tails, predicates)
//!     |
//! [Injection]              -> realize/produce/consume brackets in the tree
//!     |
//! Statement tree
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use arrayloom::{lower, Expr, Producer, ScheduleBuilder, TailStrategy, Target};
//!
//! let x = Expr::var("x");
//! let y = Expr::var("y");
//!
//! let f = Producer::define("f", &["x", "y"], vec![x.clone() + y.clone()]);
//! let g = Producer::define(
//!     "g",
//!     &["x", "y"],
//!     vec![Expr::call("f", vec![x.clone() - 1.into(), y.clone()]) * 2.into()],
//! );
//! let mut env = arrayloom::environment(vec![f, g]);
//!
//! ScheduleBuilder::new("f", 0)
//!     .split("x", "xo", "xi", 8, TailStrategy::Auto)
//!     .compute_at("g", 0, "y")
//!     .store_root()
//!     .apply(&mut env)?;
//!
//! let stmt = lower(&["g".to_string()], &env, &Target::host())?;
//! println!("{stmt}");
//! # Ok::<(), arrayloom::Error>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ir` | Expression/statement value types, substitution, analyses |
//! | `simplify` | Constant folding and normalization |
//! | `schedule` | Dims, splits, placement levels, `ScheduleBuilder` |
//! | `producer` | Producer records and the environment |
//! | `call_graph` | Direct and transitive callee extraction |
//! | `realization_order` | Evaluation order + fuse-group partition |
//! | `validate` | Placement legality |
//! | `inline` | Call-site substitution of inline producers |
//! | `lower` | Loop-nest synthesis, injection, outer driver |
//! | `target` | Device/feature capability record |
//! | `config` | Toml + environment configuration |

pub mod call_graph;
pub mod config;
pub mod error;
pub mod inline;
pub mod ir;
pub mod lower;
pub mod names;
pub mod producer;
pub mod realization_order;
pub mod schedule;
pub mod simplify;
pub mod target;
pub mod validate;

pub use config::Config;
pub use error::{Error, Result};
pub use ir::{Expr, LoopType, ScalarType, Stmt};
pub use lower::{lower, schedule_pipeline};
pub use producer::{
    environment, Environment, ExternArgument, Producer, ReductionDomain,
};
pub use realization_order::{realization_order, RealizationOrder};
pub use schedule::{LoopLevel, ScheduleBuilder, TailStrategy};
pub use simplify::simplify;
pub use target::{DeviceApi, Feature, Target};
