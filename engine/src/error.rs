//! Error taxonomy for the simulation engine.
//!
//! Three disjoint families: `ConfigError` is raised while a specification
//! is built and never afterwards; `GeneratorError` signals a pluggable
//! outcome/draw function violating its contract, aborting the affected
//! replicate; `InvariantError` signals an internal engine bug and is never
//! caught or retried.

use thiserror::Error;

/// Specification invariant violated at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("at least two arms are required, got {0}")]
    TooFewArms(usize),

    #[error("arm identifiers must be unique, `{0}` appears more than once")]
    DuplicateArm(String),

    #[error("expected one true outcome value per arm ({arms}), got {values}")]
    TruthLengthMismatch { arms: usize, values: usize },

    #[error("expected one allocation constraint per arm ({arms}), got {constraints}")]
    ConstraintLengthMismatch { arms: usize, constraints: usize },

    #[error("control arm `{0}` is not among the trial arms")]
    UnknownControl(String),

    #[error("arm `{0}`: a fixed allocation probability excludes min/max limits")]
    FixedWithLimits(String),

    #[error("arm `{arm}`: {what} = {value} lies outside [0, 1]")]
    ConstraintOutOfRange {
        arm: String,
        what: &'static str,
        value: f64,
    },

    #[error("arm `{arm}`: min limit {min} exceeds max limit {max}")]
    MinAboveMax { arm: String, min: f64, max: f64 },

    #[error("fixed plus minimum allocation sums to {0:.4}, exceeding 1")]
    ConstraintsOvercommitted(f64),

    #[error("maximum limits sum to {max_sum:.4}, below the {required:.4} left after fixed allocation")]
    MaxBelowRequired { max_sum: f64, required: f64 },

    #[error("look schedule must be non-empty and strictly increasing")]
    BadLookSchedule,

    #[error(
        "randomisation schedule must match the look schedule length, be \
         non-decreasing, and dominate the follow-up counts"
    )]
    BadRandomisationSchedule,

    #[error("{name} thresholds: expected 1 or {looks} values, got {got}")]
    ThresholdLength {
        name: &'static str,
        looks: usize,
        got: usize,
    },

    #[error("{name} thresholds may only become less strict at later looks")]
    ThresholdTightens { name: &'static str },

    #[error("{name} = {value} lies outside {range}")]
    ValueOutOfRange {
        name: &'static str,
        value: f64,
        range: &'static str,
    },

    #[error("{0} stopping rule requires a positive difference margin")]
    MissingDiffMargin(&'static str),

    #[error("control allocation policy `{policy}` requires {requirement}")]
    PolicyRequires {
        policy: &'static str,
        requirement: &'static str,
    },

    #[error("n_draws must be positive")]
    NoDraws,
}

/// A pluggable outcome/draw function broke its shape contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeneratorError {
    #[error("outcome generator returned {got} outcomes for {expected} allocations")]
    OutcomeCount { expected: usize, got: usize },

    #[error("outcome generator returned a non-finite outcome for arm `{arm}`")]
    OutcomeNonFinite { arm: String },

    #[error("draw generator returned {got} sample vectors for {expected} arms")]
    DrawMatrixShape { expected: usize, got: usize },

    #[error("draw generator returned {got} draws for arm `{arm}`, expected {expected}")]
    DrawCount {
        arm: String,
        expected: usize,
        got: usize,
    },

    #[error("draw generator returned non-finite draws for arm `{arm}`")]
    DrawNonFinite { arm: String },

    #[error("draw generator returned zero-variance draws for arm `{arm}`")]
    DegenerateDraws { arm: String },
}

/// Internal invariant violated; always a bug, always fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantError {
    #[error("allocation probabilities sum to {sum:.9}, expected 1")]
    AllocationSum { sum: f64 },

    #[error("constrained redistribution did not converge within {iterations} iterations")]
    RedistributionDiverged { iterations: usize },

    #[error("pinned allocations require {required:.4} but only {available:.4} remains")]
    MassExhausted { required: f64, available: f64 },
}

/// Any failure surfaced while running replicates or batches.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("replicate {replicate}: {source}")]
    Generator {
        replicate: usize,
        #[source]
        source: GeneratorError,
    },

    #[error("replicate {replicate}: {source}")]
    Invariant {
        replicate: usize,
        #[source]
        source: InvariantError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::TooFewArms(1);
        assert_eq!(err.to_string(), "at least two arms are required, got 1");

        let err = ConfigError::ThresholdTightens {
            name: "superiority",
        };
        assert!(err.to_string().contains("superiority"));
    }

    #[test]
    fn test_sim_error_carries_replicate() {
        let err = SimError::Generator {
            replicate: 7,
            source: GeneratorError::OutcomeCount {
                expected: 10,
                got: 9,
            },
        };
        assert!(err.to_string().starts_with("replicate 7"));
    }
}
