//! Single-trial state machine.
//!
//! One [`ReplicateEngine`] drives one simulated trial from the first look
//! to termination: advance randomisation, observe outcomes up to the
//! look's follow-up count, draw posteriors, evaluate the stopping rules,
//! and re-allocate. Transitions are one-directional; a completed look is
//! never revisited.

use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::alloc::{rescale_constraints, sqrt_control_share, update_allocation, AllocInput};
use crate::error::{GeneratorError, SimError};
use crate::model::OutcomeModel;
use crate::spec::{ArmConstraint, ControlPolicy, TrialSpec};
use crate::stats::{mad, mean, quantile, sd};
use crate::stopping::{evaluate_look, StoppingInput};

/// Final status of one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmStatus {
    Active,
    Control,
    Superior,
    DroppedInferiority,
    DroppedEquivalence,
    DroppedFutility,
}

impl ArmStatus {
    /// Whether the arm still receives allocation.
    pub fn is_allocatable(&self) -> bool {
        matches!(self, ArmStatus::Active | ArmStatus::Control)
    }
}

/// Trial-level status; terminal once non-`Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Active,
    Superiority,
    Equivalence,
    Futility,
    Max,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        *self != TrialStatus::Active
    }
}

/// Allocation and status trajectory entry, recorded per look when
/// full-history mode is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookSnapshot {
    pub look: usize,
    pub n_randomised: usize,
    pub n_observed: usize,
    /// Allocation probability used at this look, per arm (`None` once an
    /// arm no longer receives allocation).
    pub allocation: Vec<Option<f64>>,
    /// Probability of being the best arm, per arm.
    pub best_probs: Vec<Option<f64>>,
    /// Arm statuses after this look's decisions.
    pub statuses: Vec<ArmStatus>,
}

/// Final per-arm record of one replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmResult {
    pub arm: String,
    pub status: ArmStatus,
    /// Patients randomised to this arm over the whole trial.
    pub n_randomised: usize,
    /// Patients with follow-up observed by the terminating look.
    pub n_observed: usize,
    /// Outcome sum over every randomised patient.
    pub sum_all: f64,
    /// Outcome sum over patients observed by the terminating look.
    pub sum_observed: f64,
    pub raw_estimate: Option<f64>,
    /// Posterior point estimate (median or mean per `robust`).
    pub post_estimate: Option<f64>,
    /// Posterior dispersion (MAD or SD per `robust`).
    pub post_error: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    /// Allocation probability at termination, if still allocatable.
    pub final_alloc: Option<f64>,
}

/// Complete record of one simulated trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateResult {
    /// One-based replicate number within its batch.
    pub replicate: usize,
    pub status: TrialStatus,
    /// Zero-based index of the terminating look.
    pub final_look: usize,
    /// Patients randomised when the trial terminated (final sample size).
    pub n_randomised: usize,
    /// Patients with observed follow-up at the terminating look.
    pub n_observed: usize,
    pub superior_arm: Option<String>,
    pub arms: Vec<ArmResult>,
    /// Per-look trajectory, present in full-history mode.
    pub history: Option<Vec<LookSnapshot>>,
}

impl ReplicateResult {
    /// Total outcome sum across arms over all randomised patients.
    pub fn sum_all(&self) -> f64 {
        self.arms.iter().map(|a| a.sum_all).sum()
    }
}

/// Mutable per-trial state; created at the first look, destroyed at
/// termination.
struct ReplicateState {
    statuses: Vec<ArmStatus>,
    /// Arm indices still receiving allocation, in arm order.
    active: Vec<usize>,
    /// Allocation probabilities aligned with `active`.
    alloc: Vec<f64>,
    /// Working copy of the constraints; mutated by rescale-on-drop.
    constraints: Vec<ArmConstraint>,
    /// Arm index per randomised patient, in randomisation order.
    assignments: Vec<usize>,
    /// Outcome per patient with observed follow-up; parallel prefix of
    /// `assignments`.
    outcomes: Vec<f64>,
    trial_status: TrialStatus,
    superior_arm: Option<usize>,
}

impl ReplicateState {
    fn new(spec: &TrialSpec) -> Self {
        let statuses: Vec<ArmStatus> = (0..spec.n_arms())
            .map(|i| {
                if Some(i) == spec.control {
                    ArmStatus::Control
                } else {
                    ArmStatus::Active
                }
            })
            .collect();
        Self {
            active: (0..spec.n_arms()).collect(),
            alloc: vec![],
            statuses,
            constraints: spec.constraints.clone(),
            assignments: vec![],
            outcomes: vec![],
            trial_status: TrialStatus::Active,
            superior_arm: None,
        }
    }

    fn refresh_active(&mut self) {
        self.active = self
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_allocatable())
            .map(|(i, _)| i)
            .collect();
    }

    /// Outcomes observed for one arm among the first `n_observed`
    /// patients.
    fn observed_for_arm(&self, arm: usize, n_observed: usize) -> Vec<f64> {
        self.assignments[..n_observed]
            .iter()
            .zip(self.outcomes[..n_observed].iter())
            .filter(|(&a, _)| a == arm)
            .map(|(_, &y)| y)
            .collect()
    }
}

/// Drives one replicate to termination.
pub struct ReplicateEngine<'a> {
    spec: &'a TrialSpec,
    model: &'a dyn OutcomeModel,
    rng: ChaCha20Rng,
    full_history: bool,
    /// Control share frozen at trial start for `sqrt-based-start`.
    sqrt_start_share: Option<f64>,
}

impl<'a> ReplicateEngine<'a> {
    pub fn new(
        spec: &'a TrialSpec,
        model: &'a dyn OutcomeModel,
        rng: ChaCha20Rng,
        full_history: bool,
    ) -> Self {
        let sqrt_start_share = match spec.control_policy {
            ControlPolicy::SqrtBasedStart => Some(sqrt_control_share(spec.n_arms() - 1)),
            _ => None,
        };
        Self {
            spec,
            model,
            rng,
            full_history,
            sqrt_start_share,
        }
    }

    /// Run the trial to a terminal status. `replicate` is the one-based
    /// number used in result records and error reports.
    pub fn run(mut self, replicate: usize) -> Result<ReplicateResult, SimError> {
        let spec = self.spec;
        let mut state = ReplicateState::new(spec);
        let mut history: Vec<LookSnapshot> = vec![];

        // Pre-data allocation: a flat best-probability signal pushed
        // through the same transform, so policies and constraints apply
        // from the first patient on.
        let flat = vec![1.0 / spec.n_arms() as f64; spec.n_arms()];
        state.alloc = self.transform(&state, &flat, 0, replicate)?;

        let mut final_look = spec.n_looks() - 1;
        for look in 0..spec.n_looks() {
            self.advance_randomisation(&mut state, look);
            self.observe_outcomes(&mut state, look, replicate)?;

            let n_observed = spec.look_schedule[look];
            let arm_outcomes: Vec<Vec<f64>> = state
                .active
                .iter()
                .map(|&arm| state.observed_for_arm(arm, n_observed))
                .collect();
            let draws =
                self.checked_draws(&arm_outcomes, &state.active, replicate)?;

            let control = spec.control.filter(|c| state.statuses[*c] == ArmStatus::Control);
            let decision = evaluate_look(
                spec,
                &StoppingInput {
                    draws: &draws,
                    active: &state.active,
                    control,
                    // The control is never replaced mid-trial; the flag
                    // stays true for the whole run.
                    control_is_original: true,
                    look,
                    is_last_look: look + 1 == spec.n_looks(),
                },
            );

            let n_active_before = state.active.len();
            for &(arm, status) in &decision.drops {
                state.statuses[arm] = status;
            }
            if let Some(arm) = decision.superior_arm {
                state.statuses[arm] = ArmStatus::Superior;
                state.superior_arm = Some(arm);
            }
            state.trial_status = decision.trial_status;

            if self.full_history {
                history.push(self.snapshot(&state, look, &decision.best_probs));
            }

            if state.trial_status.is_terminal() {
                final_look = look;
                break;
            }

            // Keep only surviving arms, rescale constraints if anything
            // was dropped, then compute the next look's allocation.
            let survivors: Vec<f64> = state
                .active
                .iter()
                .enumerate()
                .filter(|(_, &arm)| state.statuses[arm].is_allocatable())
                .map(|(pos, _)| decision.best_probs[pos])
                .collect();
            state.refresh_active();
            let n_active_after = state.active.len();
            if n_active_after < n_active_before {
                rescale_constraints(
                    &mut state.constraints,
                    spec.rescale_policy,
                    n_active_before,
                    n_active_after,
                );
            }
            state.alloc = self.transform(&state, &survivors, look, replicate)?;
        }

        self.finalise(state, history, final_look, replicate)
    }

    fn advance_randomisation(&mut self, state: &mut ReplicateState, look: usize) {
        let target = self.spec.randomisation_schedule[look];
        while state.assignments.len() < target {
            let u: f64 = rand::Rng::gen(&mut self.rng);
            let mut acc = 0.0;
            let mut chosen = state.active[state.active.len() - 1];
            for (pos, &arm) in state.active.iter().enumerate() {
                acc += state.alloc[pos];
                if u < acc {
                    chosen = arm;
                    break;
                }
            }
            state.assignments.push(chosen);
        }
    }

    /// Generate outcomes for patients whose follow-up completes at this
    /// look, checking the generator contract.
    fn observe_outcomes(
        &mut self,
        state: &mut ReplicateState,
        look: usize,
        replicate: usize,
    ) -> Result<(), SimError> {
        let target = self.spec.look_schedule[look];
        let pending = &state.assignments[state.outcomes.len()..target];
        if pending.is_empty() {
            return Ok(());
        }
        let generated =
            self.model
                .generate_outcomes(pending, &self.spec.true_outcome_values, &mut self.rng);
        self.check_outcomes(pending, &generated, replicate)?;
        state.outcomes.extend(generated);
        Ok(())
    }

    fn check_outcomes(
        &self,
        pending: &[usize],
        generated: &[f64],
        replicate: usize,
    ) -> Result<(), SimError> {
        if generated.len() != pending.len() {
            return Err(SimError::Generator {
                replicate,
                source: GeneratorError::OutcomeCount {
                    expected: pending.len(),
                    got: generated.len(),
                },
            });
        }
        for (&arm, &y) in pending.iter().zip(generated.iter()) {
            if !y.is_finite() {
                return Err(SimError::Generator {
                    replicate,
                    source: GeneratorError::OutcomeNonFinite {
                        arm: self.spec.arms[arm].clone(),
                    },
                });
            }
        }
        Ok(())
    }

    /// Posterior draws for the given arms, contract-checked.
    fn checked_draws(
        &mut self,
        arm_outcomes: &[Vec<f64>],
        arms: &[usize],
        replicate: usize,
    ) -> Result<Vec<Vec<f64>>, SimError> {
        let draws = self
            .model
            .posterior_draws(arm_outcomes, self.spec.n_draws, &mut self.rng);
        if draws.len() != arms.len() {
            return Err(SimError::Generator {
                replicate,
                source: GeneratorError::DrawMatrixShape {
                    expected: arms.len(),
                    got: draws.len(),
                },
            });
        }
        for (&arm, row) in arms.iter().zip(draws.iter()) {
            let name = || self.spec.arms[arm].clone();
            if row.len() != self.spec.n_draws {
                return Err(SimError::Generator {
                    replicate,
                    source: GeneratorError::DrawCount {
                        arm: name(),
                        expected: self.spec.n_draws,
                        got: row.len(),
                    },
                });
            }
            if row.iter().any(|d| !d.is_finite()) {
                return Err(SimError::Generator {
                    replicate,
                    source: GeneratorError::DrawNonFinite { arm: name() },
                });
            }
            let lo = row.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if hi - lo <= 0.0 {
                return Err(SimError::Generator {
                    replicate,
                    source: GeneratorError::DegenerateDraws { arm: name() },
                });
            }
        }
        Ok(draws)
    }

    fn transform(
        &self,
        state: &ReplicateState,
        best_probs: &[f64],
        look: usize,
        replicate: usize,
    ) -> Result<Vec<f64>, SimError> {
        let control = self
            .spec
            .control
            .filter(|&c| state.statuses[c] == ArmStatus::Control);
        update_allocation(&AllocInput {
            active: &state.active,
            best_probs,
            constraints: &state.constraints,
            control,
            policy: self.spec.control_policy,
            soften: self.spec.soften_power[look],
            sqrt_start_share: self.sqrt_start_share,
        })
        .map_err(|source| SimError::Invariant { replicate, source })
    }

    fn snapshot(
        &self,
        state: &ReplicateState,
        look: usize,
        best_probs: &[f64],
    ) -> LookSnapshot {
        let n_arms = self.spec.n_arms();
        let mut allocation = vec![None; n_arms];
        let mut bp = vec![None; n_arms];
        for (pos, &arm) in state.active.iter().enumerate() {
            allocation[arm] = Some(state.alloc[pos]);
            bp[arm] = Some(best_probs[pos]);
        }
        LookSnapshot {
            look,
            n_randomised: state.assignments.len(),
            n_observed: self.spec.look_schedule[look].min(state.outcomes.len()),
            allocation,
            best_probs: bp,
            statuses: state.statuses.clone(),
        }
    }

    fn finalise(
        mut self,
        mut state: ReplicateState,
        history: Vec<LookSnapshot>,
        final_look: usize,
        replicate: usize,
    ) -> Result<ReplicateResult, SimError> {
        let spec = self.spec;
        let n_observed = spec.look_schedule[final_look];

        // Outcomes for randomised-but-unobserved patients, so the record
        // carries cumulative sums over every randomised patient.
        let pending: Vec<usize> = state.assignments[state.outcomes.len()..].to_vec();
        if !pending.is_empty() {
            let generated =
                self.model
                    .generate_outcomes(&pending, &spec.true_outcome_values, &mut self.rng);
            self.check_outcomes(&pending, &generated, replicate)?;
            state.outcomes.extend(generated);
        }

        // One reporting pass of posterior draws over every arm, using the
        // outcomes observed by the terminating look.
        let all_arms: Vec<usize> = (0..spec.n_arms()).collect();
        let final_outcomes: Vec<Vec<f64>> = all_arms
            .iter()
            .map(|&arm| state.observed_for_arm(arm, n_observed))
            .collect();
        let final_draws = self.checked_draws(&final_outcomes, &all_arms, replicate)?;

        let half_tail = (1.0 - spec.credible_interval_width) / 2.0;
        let arms = (0..spec.n_arms())
            .map(|arm| {
                let observed = &final_outcomes[arm];
                let draws = &final_draws[arm];
                let (post_estimate, post_error) = if spec.robust {
                    (quantile(draws, 0.5), mad(draws))
                } else {
                    (mean(draws), sd(draws))
                };
                let n_randomised = state.assignments.iter().filter(|&&a| a == arm).count();
                let sum_all: f64 = state
                    .assignments
                    .iter()
                    .zip(state.outcomes.iter())
                    .filter(|(&a, _)| a == arm)
                    .map(|(_, &y)| y)
                    .sum();
                let final_alloc = state
                    .active
                    .iter()
                    .position(|&a| a == arm)
                    .filter(|_| state.statuses[arm].is_allocatable())
                    .map(|pos| state.alloc[pos]);
                ArmResult {
                    arm: spec.arms[arm].clone(),
                    status: state.statuses[arm],
                    n_randomised,
                    n_observed: observed.len(),
                    sum_all,
                    sum_observed: observed.iter().sum(),
                    raw_estimate: if observed.is_empty() {
                        None
                    } else {
                        Some(self.model.raw_estimate(observed))
                    },
                    post_estimate: Some(post_estimate),
                    post_error: Some(post_error),
                    ci_lower: Some(quantile(draws, half_tail)),
                    ci_upper: Some(quantile(draws, 1.0 - half_tail)),
                    final_alloc,
                }
            })
            .collect();

        Ok(ReplicateResult {
            replicate,
            status: state.trial_status,
            final_look,
            n_randomised: state.assignments.len(),
            n_observed,
            superior_arm: state.superior_arm.map(|a| spec.arms[a].clone()),
            arms,
            history: if self.full_history {
                Some(history)
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TrialDesign;
    use rand::SeedableRng;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn run_one(spec: &TrialSpec, seed: u64) -> ReplicateResult {
        let model = spec.outcome.model();
        let rng = ChaCha20Rng::seed_from_u64(seed);
        ReplicateEngine::new(spec, model.as_ref(), rng, true)
            .run(1)
            .unwrap()
    }

    #[test]
    fn test_replicate_reaches_terminal_status() {
        let spec = TrialDesign::binomial(
            arms(&["a", "b", "c"]),
            vec![0.2, 0.25, 0.3],
            vec![60, 120, 180],
        )
        .with_n_draws(500)
        .build()
        .unwrap();
        let result = run_one(&spec, 42);
        assert!(result.status.is_terminal());
        assert!(result.final_look < 3);
        assert_eq!(
            result.n_randomised,
            spec.randomisation_schedule[result.final_look]
        );
    }

    #[test]
    fn test_replicate_is_deterministic() {
        let spec = TrialDesign::binomial(
            arms(&["a", "b"]),
            vec![0.2, 0.4],
            vec![50, 100],
        )
        .with_n_draws(500)
        .build()
        .unwrap();
        let r1 = run_one(&spec, 7);
        let r2 = run_one(&spec, 7);
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_counts_reconcile() {
        let spec = TrialDesign::binomial(
            arms(&["a", "b", "c"]),
            vec![0.25, 0.25, 0.25],
            vec![40, 80],
        )
        .with_n_draws(300)
        .build()
        .unwrap();
        let result = run_one(&spec, 11);
        let n_rand: usize = result.arms.iter().map(|a| a.n_randomised).sum();
        let n_obs: usize = result.arms.iter().map(|a| a.n_observed).sum();
        assert_eq!(n_rand, result.n_randomised);
        assert_eq!(n_obs, result.n_observed);
        for arm in &result.arms {
            assert!(arm.n_observed <= arm.n_randomised);
            assert!(arm.sum_observed <= arm.sum_all + 1e-12);
            assert!(arm.sum_all <= arm.n_randomised as f64);
        }
    }

    #[test]
    fn test_history_allocations_sum_to_one() {
        let spec = TrialDesign::binomial(
            arms(&["a", "b", "c"]),
            vec![0.2, 0.3, 0.4],
            vec![50, 100, 150],
        )
        .with_n_draws(400)
        .build()
        .unwrap();
        let result = run_one(&spec, 3);
        let history = result.history.unwrap();
        assert_eq!(history.len(), result.final_look + 1);
        for snap in &history {
            let sum: f64 = snap.allocation.iter().flatten().sum();
            assert!((sum - 1.0).abs() < 1e-6, "look {}: sum {}", snap.look, sum);
        }
    }

    #[test]
    fn test_superior_arm_recorded_on_superiority() {
        // A dramatic effect difference stops early for superiority with
        // near certainty at these sample sizes.
        let spec = TrialDesign::binomial(
            arms(&["weak", "strong"]),
            vec![0.05, 0.95],
            vec![100, 200],
        )
        .with_n_draws(1000)
        .build()
        .unwrap();
        let result = run_one(&spec, 5);
        assert_eq!(result.status, TrialStatus::Superiority);
        assert_eq!(result.superior_arm.as_deref(), Some("strong"));
        let strong = &result.arms[1];
        assert_eq!(strong.status, ArmStatus::Superior);
    }

    #[test]
    fn test_randomisation_beyond_followup_is_recorded() {
        let spec = TrialDesign::binomial(
            arms(&["a", "b"]),
            vec![0.3, 0.3],
            vec![40, 80],
        )
        .with_randomisation_schedule(vec![60, 100])
        .with_n_draws(300)
        .build()
        .unwrap();
        let result = run_one(&spec, 9);
        assert_eq!(
            result.n_randomised,
            spec.randomisation_schedule[result.final_look]
        );
        assert_eq!(result.n_observed, spec.look_schedule[result.final_look]);
        assert!(result.n_randomised > result.n_observed);
        // sum_all covers the randomised-but-unobserved tail too.
        let n_rand: usize = result.arms.iter().map(|a| a.n_randomised).sum();
        assert_eq!(n_rand, result.n_randomised);
    }

    #[test]
    fn test_generator_contract_violation_aborts() {
        struct BrokenModel;
        impl OutcomeModel for BrokenModel {
            fn generate_outcomes(
                &self,
                assignments: &[usize],
                _truth: &[f64],
                _rng: &mut ChaCha20Rng,
            ) -> Vec<f64> {
                vec![0.0; assignments.len().saturating_sub(1)] // short
            }
            fn posterior_draws(
                &self,
                arm_outcomes: &[Vec<f64>],
                n_draws: usize,
                _rng: &mut ChaCha20Rng,
            ) -> Vec<Vec<f64>> {
                vec![vec![0.5; n_draws]; arm_outcomes.len()]
            }
            fn raw_estimate(&self, outcomes: &[f64]) -> f64 {
                mean(outcomes)
            }
        }

        let spec = TrialDesign::binomial(arms(&["a", "b"]), vec![0.2, 0.3], vec![20])
            .with_n_draws(100)
            .build()
            .unwrap();
        let rng = ChaCha20Rng::seed_from_u64(1);
        let err = ReplicateEngine::new(&spec, &BrokenModel, rng, false)
            .run(3)
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::Generator {
                replicate: 3,
                source: GeneratorError::OutcomeCount { .. }
            }
        ));
    }

    #[test]
    fn test_degenerate_draws_are_rejected() {
        struct FlatModel;
        impl OutcomeModel for FlatModel {
            fn generate_outcomes(
                &self,
                assignments: &[usize],
                _truth: &[f64],
                _rng: &mut ChaCha20Rng,
            ) -> Vec<f64> {
                vec![0.0; assignments.len()]
            }
            fn posterior_draws(
                &self,
                arm_outcomes: &[Vec<f64>],
                n_draws: usize,
                _rng: &mut ChaCha20Rng,
            ) -> Vec<Vec<f64>> {
                vec![vec![0.5; n_draws]; arm_outcomes.len()] // zero variance
            }
            fn raw_estimate(&self, outcomes: &[f64]) -> f64 {
                mean(outcomes)
            }
        }

        let spec = TrialDesign::binomial(arms(&["a", "b"]), vec![0.2, 0.3], vec![20])
            .with_n_draws(100)
            .build()
            .unwrap();
        let rng = ChaCha20Rng::seed_from_u64(1);
        let err = ReplicateEngine::new(&spec, &FlatModel, rng, false)
            .run(1)
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::Generator {
                source: GeneratorError::DegenerateDraws { .. },
                ..
            }
        ));
    }
}
