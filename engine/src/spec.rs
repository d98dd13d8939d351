//! Trial specification: arms, constraints, schedules, thresholds.
//!
//! A [`TrialDesign`] is the mutable builder surface; [`TrialDesign::build`]
//! checks every structural invariant eagerly and expands scalar thresholds
//! to per-look sequences, producing an immutable [`TrialSpec`] that the
//! rest of the engine consumes. Nothing downstream ever re-validates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;
use crate::model::OutcomeKind;

const EPS: f64 = 1e-9;

/// Per-arm allocation constraint. An arm either carries a fixed allocation
/// probability or optional min/max limits, never both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmConstraint {
    #[serde(default)]
    pub fixed: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ArmConstraint {
    /// No constraint at all.
    pub fn free() -> Self {
        Self::default()
    }

    /// Pin the arm at a constant allocation probability.
    pub fn pinned(p: f64) -> Self {
        Self {
            fixed: Some(p),
            min: None,
            max: None,
        }
    }

    /// Bound the arm's allocation probability.
    pub fn limits(min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            fixed: None,
            min,
            max,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }
}

/// How the control arm's allocation probability is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlPolicy {
    /// Control behaves as an ordinary arm under RAR.
    None,
    /// Control pinned to its fixed constraint for the whole trial.
    Fixed,
    /// Square-root rule recomputed at every look; non-control arms stay
    /// under RAR.
    SqrtBased,
    /// Square-root rule recomputed at every look; non-control arms split
    /// the remaining mass equally (off RAR).
    SqrtBasedFixed,
    /// Square-root rule evaluated once with the initial arm count and
    /// never recomputed.
    SqrtBasedStart,
    /// Control mirrors the highest non-control allocation probability.
    Match,
}

impl Default for ControlPolicy {
    fn default() -> Self {
        ControlPolicy::None
    }
}

/// Whether fixed values and/or min-max limits are proportionally rescaled
/// when arms are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RescalePolicy {
    None,
    Fixed,
    Limits,
    Both,
}

impl Default for RescalePolicy {
    fn default() -> Self {
        RescalePolicy::None
    }
}

impl RescalePolicy {
    pub fn rescales_fixed(&self) -> bool {
        matches!(self, RescalePolicy::Fixed | RescalePolicy::Both)
    }

    pub fn rescales_limits(&self) -> bool {
        matches!(self, RescalePolicy::Limits | RescalePolicy::Both)
    }
}

/// A value given either once for every look or per look explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerLook {
    Scalar(f64),
    Sequence(Vec<f64>),
}

impl PerLook {
    /// Expand to one value per look.
    fn expand(&self, name: &'static str, n_looks: usize) -> Result<Vec<f64>, ConfigError> {
        match self {
            PerLook::Scalar(v) => Ok(vec![*v; n_looks]),
            PerLook::Sequence(vs) => {
                if vs.len() == 1 {
                    Ok(vec![vs[0]; n_looks])
                } else if vs.len() == n_looks {
                    Ok(vs.clone())
                } else {
                    Err(ConfigError::ThresholdLength {
                        name,
                        looks: n_looks,
                        got: vs.len(),
                    })
                }
            }
        }
    }
}

impl From<f64> for PerLook {
    fn from(v: f64) -> Self {
        PerLook::Scalar(v)
    }
}

impl From<Vec<f64>> for PerLook {
    fn from(vs: Vec<f64>) -> Self {
        PerLook::Sequence(vs)
    }
}

/// An equivalence or futility rule expanded to per-look thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRule {
    /// Probability threshold per look.
    pub probs: Vec<f64>,
    /// Absolute difference margin.
    pub diff: f64,
    /// Evaluate only against the original control (when a control exists).
    pub only_first: bool,
}

fn default_superiority() -> PerLook {
    PerLook::Scalar(0.99)
}

fn default_inferiority() -> PerLook {
    PerLook::Scalar(0.01)
}

fn default_soften() -> PerLook {
    PerLook::Scalar(1.0)
}

fn default_true() -> bool {
    true
}

fn default_ci_width() -> f64 {
    0.95
}

fn default_n_draws() -> usize {
    5000
}

/// Builder surface for a trial specification.
///
/// Populate with `new` plus the `with_*` methods (or deserialize from
/// JSON), then call [`TrialDesign::build`] to validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDesign {
    /// Ordered, distinct arm identifiers.
    pub arms: Vec<String>,
    /// Ground-truth outcome value per arm, used only by outcome generation.
    pub true_outcome_values: Vec<f64>,
    /// Outcome model the built-in generators should use.
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub control: Option<String>,
    /// One constraint per arm; empty means unconstrained everywhere.
    #[serde(default)]
    pub constraints: Vec<ArmConstraint>,
    #[serde(default)]
    pub control_policy: ControlPolicy,
    #[serde(default)]
    pub rescale_policy: RescalePolicy,
    /// Follow-up patient counts triggering each analysis.
    pub look_schedule: Vec<usize>,
    /// Cumulative randomised patient counts per look; defaults to the
    /// look schedule itself.
    #[serde(default)]
    pub randomisation_schedule: Option<Vec<usize>>,
    #[serde(default = "default_superiority")]
    pub superiority: PerLook,
    #[serde(default = "default_inferiority")]
    pub inferiority: PerLook,
    #[serde(default)]
    pub equivalence: Option<PerLook>,
    #[serde(default)]
    pub equivalence_diff: Option<f64>,
    #[serde(default = "default_true")]
    pub equivalence_only_first: bool,
    #[serde(default)]
    pub futility: Option<PerLook>,
    #[serde(default)]
    pub futility_diff: Option<f64>,
    #[serde(default = "default_true")]
    pub futility_only_first: bool,
    #[serde(default = "default_soften")]
    pub soften_power: PerLook,
    #[serde(default = "default_true")]
    pub highest_is_best: bool,
    /// Posterior point estimates via median/MAD instead of mean/SD.
    #[serde(default = "default_true")]
    pub robust: bool,
    #[serde(default = "default_ci_width")]
    pub credible_interval_width: f64,
    #[serde(default = "default_n_draws")]
    pub n_draws: usize,
}

impl TrialDesign {
    /// Start a design with the given arms, ground truth, and outcome model.
    pub fn new(
        arms: Vec<String>,
        true_outcome_values: Vec<f64>,
        outcome: OutcomeKind,
        look_schedule: Vec<usize>,
    ) -> Self {
        Self {
            arms,
            true_outcome_values,
            outcome,
            control: None,
            constraints: vec![],
            control_policy: ControlPolicy::default(),
            rescale_policy: RescalePolicy::default(),
            look_schedule,
            randomisation_schedule: None,
            superiority: default_superiority(),
            inferiority: default_inferiority(),
            equivalence: None,
            equivalence_diff: None,
            equivalence_only_first: true,
            futility: None,
            futility_diff: None,
            futility_only_first: true,
            soften_power: default_soften(),
            highest_is_best: true,
            robust: true,
            credible_interval_width: default_ci_width(),
            n_draws: default_n_draws(),
        }
    }

    /// Binomial-outcome design (event probabilities as ground truth).
    pub fn binomial(arms: Vec<String>, event_probs: Vec<f64>, look_schedule: Vec<usize>) -> Self {
        Self::new(arms, event_probs, OutcomeKind::Binomial, look_schedule)
    }

    /// Normal-outcome design with a common generating standard deviation.
    pub fn normal(
        arms: Vec<String>,
        means: Vec<f64>,
        sd: f64,
        look_schedule: Vec<usize>,
    ) -> Self {
        Self::new(arms, means, OutcomeKind::Normal { sd }, look_schedule)
    }

    pub fn with_control(mut self, control: &str) -> Self {
        self.control = Some(control.to_string());
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<ArmConstraint>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_control_policy(mut self, policy: ControlPolicy) -> Self {
        self.control_policy = policy;
        self
    }

    pub fn with_rescale_policy(mut self, policy: RescalePolicy) -> Self {
        self.rescale_policy = policy;
        self
    }

    pub fn with_randomisation_schedule(mut self, schedule: Vec<usize>) -> Self {
        self.randomisation_schedule = Some(schedule);
        self
    }

    pub fn with_superiority(mut self, thresholds: impl Into<PerLook>) -> Self {
        self.superiority = thresholds.into();
        self
    }

    pub fn with_inferiority(mut self, thresholds: impl Into<PerLook>) -> Self {
        self.inferiority = thresholds.into();
        self
    }

    pub fn with_equivalence(mut self, thresholds: impl Into<PerLook>, diff: f64) -> Self {
        self.equivalence = Some(thresholds.into());
        self.equivalence_diff = Some(diff);
        self
    }

    pub fn with_futility(mut self, thresholds: impl Into<PerLook>, diff: f64) -> Self {
        self.futility = Some(thresholds.into());
        self.futility_diff = Some(diff);
        self
    }

    pub fn with_soften_power(mut self, soften: impl Into<PerLook>) -> Self {
        self.soften_power = soften.into();
        self
    }

    pub fn with_lowest_is_best(mut self) -> Self {
        self.highest_is_best = false;
        self
    }

    pub fn with_n_draws(mut self, n_draws: usize) -> Self {
        self.n_draws = n_draws;
        self
    }

    pub fn with_robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    /// Validate every invariant and produce the immutable specification.
    pub fn build(self) -> Result<TrialSpec, ConfigError> {
        let n_arms = self.arms.len();
        if n_arms < 2 {
            return Err(ConfigError::TooFewArms(n_arms));
        }

        let mut seen = HashSet::new();
        for arm in &self.arms {
            if !seen.insert(arm.as_str()) {
                return Err(ConfigError::DuplicateArm(arm.clone()));
            }
        }

        if self.true_outcome_values.len() != n_arms {
            return Err(ConfigError::TruthLengthMismatch {
                arms: n_arms,
                values: self.true_outcome_values.len(),
            });
        }

        let control = match &self.control {
            None => None,
            Some(name) => Some(
                self.arms
                    .iter()
                    .position(|a| a == name)
                    .ok_or_else(|| ConfigError::UnknownControl(name.clone()))?,
            ),
        };

        let constraints = if self.constraints.is_empty() {
            vec![ArmConstraint::free(); n_arms]
        } else if self.constraints.len() == n_arms {
            self.constraints.clone()
        } else {
            return Err(ConfigError::ConstraintLengthMismatch {
                arms: n_arms,
                constraints: self.constraints.len(),
            });
        };

        validate_constraints(&self.arms, &constraints)?;
        validate_policy(self.control_policy, control, &constraints)?;

        let n_looks = self.look_schedule.len();
        if n_looks == 0
            || self.look_schedule[0] == 0
            || self.look_schedule.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(ConfigError::BadLookSchedule);
        }

        let randomisation_schedule = match &self.randomisation_schedule {
            None => self.look_schedule.clone(),
            Some(rs) => {
                let dominated = rs.len() == n_looks
                    && rs.windows(2).all(|w| w[1] >= w[0])
                    && rs
                        .iter()
                        .zip(self.look_schedule.iter())
                        .all(|(r, l)| r >= l);
                if !dominated {
                    return Err(ConfigError::BadRandomisationSchedule);
                }
                rs.clone()
            }
        };

        let superiority = self.superiority.expand("superiority", n_looks)?;
        check_probs("superiority", &superiority)?;
        // Stricter superiority means a higher threshold.
        if superiority.windows(2).any(|w| w[1] > w[0] + EPS) {
            return Err(ConfigError::ThresholdTightens {
                name: "superiority",
            });
        }

        let inferiority = self.inferiority.expand("inferiority", n_looks)?;
        check_probs("inferiority", &inferiority)?;
        // Stricter inferiority means a lower threshold.
        if inferiority.windows(2).any(|w| w[1] < w[0] - EPS) {
            return Err(ConfigError::ThresholdTightens {
                name: "inferiority",
            });
        }

        let equivalence = build_margin_rule(
            "equivalence",
            &self.equivalence,
            self.equivalence_diff,
            self.equivalence_only_first,
            n_looks,
        )?;
        let futility = build_margin_rule(
            "futility",
            &self.futility,
            self.futility_diff,
            self.futility_only_first,
            n_looks,
        )?;

        let soften_power = self.soften_power.expand("soften_power", n_looks)?;
        for &s in &soften_power {
            if !(0.0..=1.0).contains(&s) {
                return Err(ConfigError::ValueOutOfRange {
                    name: "soften_power",
                    value: s,
                    range: "[0, 1]",
                });
            }
        }

        if !(self.credible_interval_width > 0.0 && self.credible_interval_width < 1.0) {
            return Err(ConfigError::ValueOutOfRange {
                name: "credible_interval_width",
                value: self.credible_interval_width,
                range: "(0, 1)",
            });
        }

        if self.n_draws == 0 {
            return Err(ConfigError::NoDraws);
        }

        Ok(TrialSpec {
            arms: self.arms,
            true_outcome_values: self.true_outcome_values,
            outcome: self.outcome,
            control,
            constraints,
            control_policy: self.control_policy,
            rescale_policy: self.rescale_policy,
            look_schedule: self.look_schedule,
            randomisation_schedule,
            superiority,
            inferiority,
            equivalence,
            futility,
            soften_power,
            highest_is_best: self.highest_is_best,
            robust: self.robust,
            credible_interval_width: self.credible_interval_width,
            n_draws: self.n_draws,
        })
    }
}

fn check_probs(name: &'static str, values: &[f64]) -> Result<(), ConfigError> {
    for &v in values {
        if !(0.0..=1.0).contains(&v) {
            return Err(ConfigError::ValueOutOfRange {
                name,
                value: v,
                range: "[0, 1]",
            });
        }
    }
    Ok(())
}

fn build_margin_rule(
    name: &'static str,
    probs: &Option<PerLook>,
    diff: Option<f64>,
    only_first: bool,
    n_looks: usize,
) -> Result<Option<MarginRule>, ConfigError> {
    let Some(per_look) = probs else {
        return Ok(None);
    };
    let diff = match diff {
        Some(d) if d > 0.0 => d,
        _ => return Err(ConfigError::MissingDiffMargin(name)),
    };
    let probs = per_look.expand(name, n_looks)?;
    check_probs(name, &probs)?;
    // Stricter equivalence/futility means a higher probability threshold.
    if probs.windows(2).any(|w| w[1] > w[0] + EPS) {
        return Err(ConfigError::ThresholdTightens { name });
    }
    Ok(Some(MarginRule {
        probs,
        diff,
        only_first,
    }))
}

fn validate_constraints(arms: &[String], constraints: &[ArmConstraint]) -> Result<(), ConfigError> {
    let mut fixed_sum = 0.0;
    let mut min_sum = 0.0;
    let mut max_sum = 0.0;
    let mut all_free_have_max = true;

    for (arm, c) in arms.iter().zip(constraints.iter()) {
        if let Some(f) = c.fixed {
            if c.min.is_some() || c.max.is_some() {
                return Err(ConfigError::FixedWithLimits(arm.clone()));
            }
            if !(0.0..=1.0).contains(&f) {
                return Err(ConfigError::ConstraintOutOfRange {
                    arm: arm.clone(),
                    what: "fixed",
                    value: f,
                });
            }
            fixed_sum += f;
            continue;
        }
        if let Some(min) = c.min {
            if !(0.0..=1.0).contains(&min) {
                return Err(ConfigError::ConstraintOutOfRange {
                    arm: arm.clone(),
                    what: "min",
                    value: min,
                });
            }
            min_sum += min;
        }
        match c.max {
            Some(max) => {
                if !(0.0..=1.0).contains(&max) {
                    return Err(ConfigError::ConstraintOutOfRange {
                        arm: arm.clone(),
                        what: "max",
                        value: max,
                    });
                }
                if let Some(min) = c.min {
                    if min > max {
                        return Err(ConfigError::MinAboveMax {
                            arm: arm.clone(),
                            min,
                            max,
                        });
                    }
                }
                max_sum += max;
            }
            None => all_free_have_max = false,
        }
    }

    if fixed_sum + min_sum > 1.0 + EPS {
        return Err(ConfigError::ConstraintsOvercommitted(fixed_sum + min_sum));
    }
    let required = 1.0 - fixed_sum;
    if all_free_have_max && max_sum < required - EPS {
        return Err(ConfigError::MaxBelowRequired { max_sum, required });
    }
    Ok(())
}

fn validate_policy(
    policy: ControlPolicy,
    control: Option<usize>,
    constraints: &[ArmConstraint],
) -> Result<(), ConfigError> {
    match policy {
        ControlPolicy::None => Ok(()),
        ControlPolicy::Fixed => {
            let Some(c) = control else {
                return Err(ConfigError::PolicyRequires {
                    policy: "fixed",
                    requirement: "a control arm",
                });
            };
            if !constraints[c].is_fixed() {
                return Err(ConfigError::PolicyRequires {
                    policy: "fixed",
                    requirement: "a fixed allocation constraint on the control arm",
                });
            }
            Ok(())
        }
        ControlPolicy::SqrtBased
        | ControlPolicy::SqrtBasedFixed
        | ControlPolicy::SqrtBasedStart
        | ControlPolicy::Match => {
            let name = match policy {
                ControlPolicy::SqrtBased => "sqrt-based",
                ControlPolicy::SqrtBasedFixed => "sqrt-based-fixed",
                ControlPolicy::SqrtBasedStart => "sqrt-based-start",
                _ => "match",
            };
            let Some(c) = control else {
                return Err(ConfigError::PolicyRequires {
                    policy: name,
                    requirement: "a control arm",
                });
            };
            if constraints[c] != ArmConstraint::free() {
                return Err(ConfigError::PolicyRequires {
                    policy: name,
                    requirement: "an unconstrained control arm",
                });
            }
            if policy != ControlPolicy::Match {
                // The square-root rule can reserve up to half of the mass
                // for the control (the k = 1 share); the non-control
                // fixed/min commitments must stay feasible under it.
                let committed: f64 = constraints
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != c)
                    .map(|(_, cc)| cc.fixed.or(cc.min).unwrap_or(0.0))
                    .sum();
                if committed > 0.5 + EPS {
                    return Err(ConfigError::PolicyRequires {
                        policy: name,
                        requirement:
                            "non-control fixed/min commitments of at most 0.5 in total",
                    });
                }
            }
            Ok(())
        }
    }
}

/// Immutable, validated trial specification.
///
/// Produced only by [`TrialDesign::build`]; all thresholds and the soften
/// power are already expanded to one value per look, and the control is an
/// index into `arms`. Construction-time validation is the only validation:
/// the engine trusts every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSpec {
    pub arms: Vec<String>,
    pub true_outcome_values: Vec<f64>,
    pub outcome: OutcomeKind,
    pub control: Option<usize>,
    pub constraints: Vec<ArmConstraint>,
    pub control_policy: ControlPolicy,
    pub rescale_policy: RescalePolicy,
    pub look_schedule: Vec<usize>,
    pub randomisation_schedule: Vec<usize>,
    pub superiority: Vec<f64>,
    pub inferiority: Vec<f64>,
    pub equivalence: Option<MarginRule>,
    pub futility: Option<MarginRule>,
    pub soften_power: Vec<f64>,
    pub highest_is_best: bool,
    pub robust: bool,
    pub credible_interval_width: f64,
    pub n_draws: usize,
}

impl TrialSpec {
    pub fn n_arms(&self) -> usize {
        self.arms.len()
    }

    pub fn n_looks(&self) -> usize {
        self.look_schedule.len()
    }

    /// Maximum possible sample size (last randomisation-schedule entry).
    pub fn max_sample_size(&self) -> usize {
        *self.randomisation_schedule.last().unwrap_or(&0)
    }
}
