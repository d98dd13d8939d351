//! Pluggable outcome generation and posterior sampling.
//!
//! The engine's only contract with the outcome process is the
//! [`OutcomeModel`] trait: generate one outcome per newly randomised
//! patient, produce posterior draws per active arm, and summarise raw
//! outcomes. Two built-ins ship with the crate (binomial and normal);
//! anything else is the caller's implementation. Shape and finiteness of
//! the returned values are enforced by the engine, not here.

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::stats::{mean, sample_beta, sample_normal, sd};

/// Standard deviation of the synthetic posterior used for arms with at
/// most one observation, keeping extremal comparisons finite.
const DIFFUSE_SD: f64 = 1000.0;

/// Capability interface for a trial's outcome process.
pub trait OutcomeModel: Send + Sync {
    /// One outcome per newly randomised patient, given each patient's arm
    /// index and the per-arm ground-truth values.
    fn generate_outcomes(
        &self,
        assignments: &[usize],
        truth: &[f64],
        rng: &mut ChaCha20Rng,
    ) -> Vec<f64>;

    /// `n_draws` posterior samples per arm, one inner vector per entry of
    /// `arm_outcomes` (the outcomes observed so far for that arm). Must
    /// stay finite and non-degenerate even for arms with ≤ 1 observation.
    fn posterior_draws(
        &self,
        arm_outcomes: &[Vec<f64>],
        n_draws: usize,
        rng: &mut ChaCha20Rng,
    ) -> Vec<Vec<f64>>;

    /// Point summary of raw outcomes reported alongside posterior
    /// estimates. Callers never pass an empty slice.
    fn raw_estimate(&self, outcomes: &[f64]) -> f64;
}

/// Which built-in outcome model a design uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    /// Bernoulli outcomes; conjugate Beta(1 + events, 1 + non-events)
    /// posterior draws.
    Binomial,
    /// Normal outcomes with a common generating standard deviation;
    /// normal posterior approximation for the mean.
    Normal { sd: f64 },
}

impl OutcomeKind {
    /// Instantiate the built-in model for this kind.
    pub fn model(&self) -> Box<dyn OutcomeModel> {
        match self {
            OutcomeKind::Binomial => Box::new(BinomialModel),
            OutcomeKind::Normal { sd } => Box::new(NormalModel { sd: *sd }),
        }
    }
}

/// Bernoulli outcomes with Beta-conjugate posterior draws.
///
/// A flat Beta(1, 1) prior keeps the posterior proper at any sample size,
/// so arms with no observations naturally receive uniform (maximally
/// diffuse) draws.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinomialModel;

impl OutcomeModel for BinomialModel {
    fn generate_outcomes(
        &self,
        assignments: &[usize],
        truth: &[f64],
        rng: &mut ChaCha20Rng,
    ) -> Vec<f64> {
        assignments
            .iter()
            .map(|&arm| {
                if rng.gen::<f64>() < truth[arm] {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn posterior_draws(
        &self,
        arm_outcomes: &[Vec<f64>],
        n_draws: usize,
        rng: &mut ChaCha20Rng,
    ) -> Vec<Vec<f64>> {
        arm_outcomes
            .iter()
            .map(|outcomes| {
                let events: f64 = outcomes.iter().sum();
                let non_events = outcomes.len() as f64 - events;
                (0..n_draws)
                    .map(|_| sample_beta(rng, 1.0 + events, 1.0 + non_events))
                    .collect()
            })
            .collect()
    }

    fn raw_estimate(&self, outcomes: &[f64]) -> f64 {
        mean(outcomes)
    }
}

/// Normally distributed outcomes with posterior draws for the mean.
///
/// Draws come from N(sample mean, sample SD / sqrt(n)). Arms with ≤ 1
/// observation (or a degenerate sample SD) receive a deliberately diffuse
/// synthetic posterior instead of an undefined variance.
#[derive(Debug, Clone, Copy)]
pub struct NormalModel {
    /// Generating standard deviation shared by all arms.
    pub sd: f64,
}

impl Default for NormalModel {
    fn default() -> Self {
        Self { sd: 1.0 }
    }
}

impl OutcomeModel for NormalModel {
    fn generate_outcomes(
        &self,
        assignments: &[usize],
        truth: &[f64],
        rng: &mut ChaCha20Rng,
    ) -> Vec<f64> {
        assignments
            .iter()
            .map(|&arm| sample_normal(rng, truth[arm], self.sd))
            .collect()
    }

    fn posterior_draws(
        &self,
        arm_outcomes: &[Vec<f64>],
        n_draws: usize,
        rng: &mut ChaCha20Rng,
    ) -> Vec<Vec<f64>> {
        arm_outcomes
            .iter()
            .map(|outcomes| {
                let n = outcomes.len();
                let (centre, scale) = if n <= 1 {
                    (outcomes.first().copied().unwrap_or(0.0), DIFFUSE_SD)
                } else {
                    let s = sd(outcomes);
                    if s > 0.0 {
                        (mean(outcomes), s / (n as f64).sqrt())
                    } else {
                        (mean(outcomes), DIFFUSE_SD)
                    }
                };
                (0..n_draws)
                    .map(|_| sample_normal(rng, centre, scale))
                    .collect()
            })
            .collect()
    }

    fn raw_estimate(&self, outcomes: &[f64]) -> f64 {
        mean(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_binomial_outcomes_match_truth_rate() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let model = BinomialModel;
        let assignments = vec![0; 10_000];
        let outcomes = model.generate_outcomes(&assignments, &[0.3], &mut rng);
        assert!(outcomes.iter().all(|&y| y == 0.0 || y == 1.0));
        assert!((mean(&outcomes) - 0.3).abs() < 0.02);
    }

    #[test]
    fn test_binomial_draws_concentrate_with_data() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let model = BinomialModel;
        // 40 events in 100 patients
        let mut outcomes = vec![1.0; 40];
        outcomes.extend(vec![0.0; 60]);
        let draws = model.posterior_draws(&[outcomes], 4000, &mut rng);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].len(), 4000);
        let m = mean(&draws[0]);
        assert!((m - 41.0 / 102.0).abs() < 0.02, "posterior mean {}", m);
    }

    #[test]
    fn test_binomial_empty_arm_gets_uniform_draws() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let model = BinomialModel;
        let draws = model.posterior_draws(&[vec![]], 4000, &mut rng);
        let m = mean(&draws[0]);
        assert!((m - 0.5).abs() < 0.03);
        assert!(sd(&draws[0]) > 0.2); // diffuse, not a point mass
    }

    #[test]
    fn test_normal_draws_track_sample_mean() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let model = NormalModel { sd: 2.0 };
        let outcomes: Vec<f64> = (0..200).map(|i| 5.0 + (i % 5) as f64 * 0.1).collect();
        let draws = model.posterior_draws(&[outcomes.clone()], 4000, &mut rng);
        assert!((mean(&draws[0]) - mean(&outcomes)).abs() < 0.05);
        assert!(draws[0].iter().all(|d| d.is_finite()));
    }

    #[test]
    fn test_normal_single_observation_is_diffuse_but_finite() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let model = NormalModel::default();
        let draws = model.posterior_draws(&[vec![7.0]], 1000, &mut rng);
        assert!(draws[0].iter().all(|d| d.is_finite()));
        assert!(sd(&draws[0]) > 100.0);
    }

    #[test]
    fn test_outcome_kind_builds_models() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let model = OutcomeKind::Normal { sd: 0.5 }.model();
        let ys = model.generate_outcomes(&[0, 1], &[1.0, 2.0], &mut rng);
        assert_eq!(ys.len(), 2);
        assert_eq!(model.raw_estimate(&[1.0, 3.0]), 2.0);
    }
}
