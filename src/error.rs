//! # Scheduler Error Types
//!
//! Every variant here is a user error: the requested schedule (or pipeline
//! shape) is illegal, and compilation stops with no partial result.
//! Synthesizer bugs - a store or compute level not found after mutation,
//! an unknown dim, an unknown callee - are not represented here; those are
//! non-recoverable panics.

use thiserror::Error;

/// Result alias used across the scheduling middle-end.
pub type Result<T> = std::result::Result<T, Error>;

/// User-facing scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The producer dependency graph has a cycle.
    #[error("stuck in a loop computing a realization order; the pipeline has a cycle through '{func}'")]
    CyclicPipeline { func: String },

    /// Two co-scheduled producers depend on each other through the call
    /// graph.
    #[error("invalid compute_with: there is a dependency between {func_1} and {func_2}")]
    FuseDependencyCycle { func_1: String, func_2: String },

    /// Two producers request compute_with of each other.
    #[error("found cyclic dependencies between compute_with of {func_1} and {func_2}")]
    FusedPairCycle { func_1: String, func_2: String },

    /// The realization order interleaves members of different fuse groups.
    #[error("fuse group containing '{func}' is not contiguous in the realization order")]
    NonContiguousFuseGroup { func: String },

    /// The same co-schedule request was recorded twice.
    #[error("found duplicates of fused pair ({func_1}.s{stage_1}, {func_2}.s{stage_2}, {var})")]
    DuplicateFusedPair {
        func_1: String,
        stage_1: usize,
        func_2: String,
        stage_2: usize,
        var: String,
    },

    /// A co-scheduled stage is inline, extern, or specialized.
    #[error("invalid compute_with: {func}.s{stage} {reason}")]
    InvalidFuseMember {
        func: String,
        stage: usize,
        reason: String,
    },

    /// Co-scheduled stages disagree on the shared outer dims.
    #[error("invalid compute_with: {detail}")]
    MismatchedFusedDims { detail: String },

    /// Co-scheduled producers are computed at different loop levels.
    #[error(
        "invalid compute_with: the compute levels of {func_1}.s{stage_1} (computed at {level_1}) \
         and {func_2}.s{stage_2} ({level_2}) do not match"
    )]
    MismatchedComputeLevel {
        func_1: String,
        stage_1: usize,
        level_1: String,
        func_2: String,
        stage_2: usize,
        level_2: String,
    },

    /// The requested placement is not among the legal sites for the
    /// producer's uses.
    #[error(
        "producer \"{func}\" is computed at the following invalid location:\n  {requested}\n\
         legal locations for this producer are:\n{legal}\"{func}\" is used in the following places:\n{uses}"
    )]
    IllegalSite {
        func: String,
        requested: String,
        legal: String,
        uses: String,
    },

    /// The store level does not enclose the compute level.
    #[error("producer \"{func}\" has a store level that does not enclose its compute level: {detail}")]
    StoreOutsideCompute { func: String, detail: String },

    /// A parallel or vectorized loop sits between the store and compute
    /// levels.
    #[error(
        "producer \"{func}\" is stored outside the parallel loop over {loop_level} \
         but computed within it; this is a potential race condition"
    )]
    RaceBetweenStoreAndCompute { func: String, loop_level: String },

    /// Output producers must be scheduled at root.
    #[error("producer \"{func}\" is an output, so it must be scheduled with compute and storage at root")]
    OutputNotRoot { func: String },

    /// Inline producers cannot carry specializations.
    #[error(
        "producer \"{func}\" is scheduled inline, so it must not have any specializations; \
         specialize on the scheduled producer instead"
    )]
    InlineWithSpecialization { func: String },

    /// A dim requests a device API the target cannot run.
    #[error("schedule for producer \"{func}\" requires {device} but no compatible feature is enabled in target {target}")]
    UnsupportedDevice {
        func: String,
        device: String,
        target: String,
    },

    /// An input of an extern producer is scheduled inline.
    #[error(
        "producer \"{input}\" cannot be scheduled inline because it is used by \
         the externally computed producer \"{func}\""
    )]
    ExternInputInline { func: String, input: String },

    /// Split factors must be strictly positive.
    #[error("can't split {var} by {factor}; split factors must be strictly positive")]
    BadSplitFactor { var: String, factor: String },

    /// ShiftInwards would recompute sites an update stage already wrote.
    #[error(
        "when splitting {var}, ShiftInwards is not a legal tail strategy for update \
         definitions, as it may change the meaning of the algorithm"
    )]
    InvalidTailStrategyForUpdate { var: String },

    /// Reduction-variable splits must not visit sites outside the domain.
    #[error(
        "when splitting {var}, the tail strategy must be GuardWithIf or Auto; \
         anything else may change the meaning of the algorithm"
    )]
    InvalidTailStrategyForExactSplit { var: String },

    /// A target string contained an unrecognized token.
    #[error("unknown target feature '{token}'")]
    UnknownTargetFeature { token: String },
}
