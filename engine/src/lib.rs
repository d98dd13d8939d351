//! Adaptive multi-arm clinical trial simulation engine.
//!
//! This crate simulates adaptive, multi-arm, multi-stage trials: at each
//! interim analysis a trial may stop for statistical conclusiveness, drop
//! arms, and re-allocate future patients toward better-performing arms
//! (response-adaptive randomisation). The binary (`src/bin/tsim.rs`) is
//! just a thin harness around these components.
//!
//! # Architecture
//!
//! - **Specification** (`spec`): the immutable, validated trial
//!   configuration. Every structural invariant is checked once at build
//!   time; simulation never re-validates.
//!
//! - **Outcome models** (`model`): the pluggable outcome/posterior-draw
//!   seam. Binomial and normal built-ins ship with the crate.
//!
//! - **Decision rules** (`stopping`) and the **allocation transform**
//!   (`alloc`): pure functions from posterior signals to arm decisions
//!   and allocation probabilities.
//!
//! - **Replicate engine** (`replicate`): the per-trial state machine,
//!   one ChaCha20 stream per replicate.
//!
//! - **Batch runner** (`batch`) and **performance aggregation**
//!   (`performance`): reproducible Monte-Carlo orchestration (identical
//!   results for any worker count) and metric reduction with optional
//!   bootstrap uncertainty.

pub mod alloc;
pub mod batch;
pub mod error;
pub mod model;
pub mod performance;
pub mod replicate;
pub mod spec;
pub mod stats;
pub mod stopping;

// --- Re-exports for ergonomic external use ---------------------------------

pub use batch::{run_trials, BatchConfig, ExecutionMode, TrialBatch};
pub use error::{ConfigError, GeneratorError, InvariantError, SimError};
pub use model::{BinomialModel, NormalModel, OutcomeKind, OutcomeModel};
pub use performance::{
    check_performance, BootstrapConfig, PerformanceConfig, PerformanceReport,
    Restriction, SelectionStrategy,
};
pub use replicate::{ArmStatus, ReplicateEngine, ReplicateResult, TrialStatus};
pub use spec::{ArmConstraint, ControlPolicy, RescalePolicy, TrialDesign, TrialSpec};
