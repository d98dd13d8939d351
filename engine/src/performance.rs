//! Batch-level performance metrics with optional bootstrap uncertainty.
//!
//! Reduces a [`TrialBatch`] to distributional summaries, terminal-status
//! proportions, selection probabilities under a configurable strategy,
//! error metrics against ground truth, and the Ideal Design Percentage.
//! Metrics that cannot be estimated (no selections, single replicate,
//! zero truth spread) degrade to `None` instead of failing. The bootstrap
//! resamples replicate indices with replacement, one derived generator
//! stream per resample.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::batch::TrialBatch;
use crate::replicate::{ReplicateResult, TrialStatus};
use crate::spec::TrialSpec;
use crate::stats::{mad, mean, median, quantile, sd};

/// How an arm is selected for non-superiority replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Never select an arm.
    None,
    /// Select the control when it is still active at termination.
    ControlIfAvailable,
    /// Select the best-estimated arm still active at termination.
    BestRemaining,
    /// Select the first listed arm still active at termination.
    Preference(Vec<String>),
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::None
    }
}

/// Which replicates enter the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Restriction {
    All,
    SuperiorOnly,
    SelectedOnly,
}

impl Default for Restriction {
    fn default() -> Self {
        Restriction::All
    }
}

/// Non-parametric bootstrap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub n_boot: usize,
    pub boot_seed: u64,
    /// Width of the percentile confidence intervals.
    pub ci_width: f64,
}

impl BootstrapConfig {
    pub fn new(n_boot: usize, boot_seed: u64) -> Self {
        Self {
            n_boot,
            boot_seed,
            ci_width: 0.95,
        }
    }
}

/// Aggregation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub selection: SelectionStrategy,
    #[serde(default)]
    pub restriction: Restriction,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

impl PerformanceConfig {
    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restriction = restriction;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }
}

/// Seven-number summary of one quantity across replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistSummary {
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub median: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl DistSummary {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: None,
                sd: None,
                median: None,
                p25: None,
                p75: None,
                min: None,
                max: None,
            };
        }
        let s = sd(values);
        Self {
            mean: Some(mean(values)),
            sd: if s.is_finite() { Some(s) } else { None },
            median: Some(median(values)),
            p25: Some(quantile(values, 0.25)),
            p75: Some(quantile(values, 0.75)),
            min: Some(values.iter().cloned().fold(f64::INFINITY, f64::min)),
            max: Some(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        }
    }
}

/// Point estimates of every performance metric over one replicate subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub n_summarised: usize,
    pub size: DistSummary,
    pub sum_ys: DistSummary,
    pub prob_superiority: Option<f64>,
    pub prob_equivalence: Option<f64>,
    pub prob_futility: Option<f64>,
    pub prob_max: Option<f64>,
    pub prob_conclusive: Option<f64>,
    /// Selection probability per arm, in arm order.
    pub select_probs: Vec<(String, Option<f64>)>,
    pub prob_select_none: Option<f64>,
    /// Root-mean-square error of the selected arm's estimate.
    pub rmse: Option<f64>,
    /// Median absolute error of the selected arm's estimate.
    pub mae: Option<f64>,
    /// RMSE of the selected-vs-control treatment effect estimate.
    pub rmse_te: Option<f64>,
    /// Median absolute error of the treatment effect estimate.
    pub mae_te: Option<f64>,
    /// Ideal Design Percentage.
    pub idp: Option<f64>,
}

impl BatchSummary {
    /// Flatten to named rows; the flag marks metrics the bootstrap may
    /// summarise (extremal metrics never are).
    fn rows(&self) -> Vec<(String, Option<f64>, bool)> {
        let mut rows = vec![];
        let dist = |rows: &mut Vec<(String, Option<f64>, bool)>, prefix: &str, d: &DistSummary| {
            rows.push((format!("{prefix}_mean"), d.mean, true));
            rows.push((format!("{prefix}_sd"), d.sd, true));
            rows.push((format!("{prefix}_median"), d.median, true));
            rows.push((format!("{prefix}_p25"), d.p25, true));
            rows.push((format!("{prefix}_p75"), d.p75, true));
            rows.push((format!("{prefix}_min"), d.min, false));
            rows.push((format!("{prefix}_max"), d.max, false));
        };
        dist(&mut rows, "size", &self.size);
        dist(&mut rows, "sum_ys", &self.sum_ys);
        rows.push(("prob_superiority".into(), self.prob_superiority, true));
        rows.push(("prob_equivalence".into(), self.prob_equivalence, true));
        rows.push(("prob_futility".into(), self.prob_futility, true));
        rows.push(("prob_max".into(), self.prob_max, true));
        rows.push(("prob_conclusive".into(), self.prob_conclusive, true));
        for (arm, p) in &self.select_probs {
            rows.push((format!("prob_select_{arm}"), *p, true));
        }
        rows.push(("prob_select_none".into(), self.prob_select_none, true));
        rows.push(("rmse".into(), self.rmse, true));
        rows.push(("mae".into(), self.mae, true));
        rows.push(("rmse_te".into(), self.rmse_te, true));
        rows.push(("mae_te".into(), self.mae_te, true));
        rows.push(("idp".into(), self.idp, true));
        rows
    }
}

/// Bootstrap spread and interval for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUncertainty {
    pub metric: String,
    pub estimate: Option<f64>,
    pub sd: Option<f64>,
    /// Normal-consistent MAD-based robust SD.
    pub robust_sd: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

/// Bootstrap results across all metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub n_boot: usize,
    pub boot_seed: u64,
    pub ci_width: f64,
    pub rows: Vec<MetricUncertainty>,
}

/// Point estimates plus optional bootstrap uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub estimates: BatchSummary,
    pub uncertainty: Option<BootstrapSummary>,
}

impl PerformanceReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Best available point estimate for one arm of one replicate.
fn arm_estimate(rep: &ReplicateResult, arm: usize) -> Option<f64> {
    rep.arms[arm]
        .post_estimate
        .or(rep.arms[arm].raw_estimate)
}

/// Arm selected for one replicate. Superiority replicates always select
/// the superior arm; the strategy only applies to the rest.
fn select_arm(
    spec: &TrialSpec,
    rep: &ReplicateResult,
    strategy: &SelectionStrategy,
) -> Option<usize> {
    if rep.status == TrialStatus::Superiority {
        return rep
            .superior_arm
            .as_deref()
            .and_then(|name| spec.arms.iter().position(|a| a == name));
    }
    match strategy {
        SelectionStrategy::None => None,
        SelectionStrategy::ControlIfAvailable => spec
            .control
            .filter(|&c| rep.arms[c].status.is_allocatable()),
        SelectionStrategy::BestRemaining => {
            let mut best: Option<(usize, f64)> = None;
            for arm in 0..spec.n_arms() {
                if !rep.arms[arm].status.is_allocatable() {
                    continue;
                }
                let Some(est) = arm_estimate(rep, arm) else {
                    continue;
                };
                let better = match best {
                    None => true,
                    Some((_, cur)) => {
                        if spec.highest_is_best {
                            est > cur
                        } else {
                            est < cur
                        }
                    }
                };
                if better {
                    best = Some((arm, est));
                }
            }
            best.map(|(arm, _)| arm)
        }
        SelectionStrategy::Preference(order) => order.iter().find_map(|name| {
            spec.arms
                .iter()
                .position(|a| a == name)
                .filter(|&arm| rep.arms[arm].status.is_allocatable())
        }),
    }
}

fn proportion(count: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(count as f64 / total as f64)
    }
}

/// Summarise a subset of replicates under the given configuration.
fn summarise_reps(
    spec: &TrialSpec,
    reps: &[&ReplicateResult],
    cfg: &PerformanceConfig,
) -> BatchSummary {
    let selections: Vec<Option<usize>> = reps
        .iter()
        .map(|rep| select_arm(spec, rep, &cfg.selection))
        .collect();

    let kept: Vec<usize> = (0..reps.len())
        .filter(|&i| match cfg.restriction {
            Restriction::All => true,
            Restriction::SuperiorOnly => reps[i].status == TrialStatus::Superiority,
            Restriction::SelectedOnly => selections[i].is_some(),
        })
        .collect();
    let n = kept.len();

    let sizes: Vec<f64> = kept.iter().map(|&i| reps[i].n_randomised as f64).collect();
    let sums: Vec<f64> = kept.iter().map(|&i| reps[i].sum_all()).collect();

    let count_status = |status: TrialStatus| {
        kept.iter().filter(|&&i| reps[i].status == status).count()
    };
    let n_superiority = count_status(TrialStatus::Superiority);
    let n_equivalence = count_status(TrialStatus::Equivalence);
    let n_futility = count_status(TrialStatus::Futility);

    let select_probs: Vec<(String, Option<f64>)> = spec
        .arms
        .iter()
        .enumerate()
        .map(|(arm, name)| {
            let count = kept
                .iter()
                .filter(|&&i| selections[i] == Some(arm))
                .count();
            (name.clone(), proportion(count, n))
        })
        .collect();
    let n_none = kept.iter().filter(|&&i| selections[i].is_none()).count();

    // Error metrics over replicates with a selection and an estimate.
    let mut errs = vec![];
    let mut errs_te = vec![];
    for &i in &kept {
        let Some(arm) = selections[i] else { continue };
        let Some(est) = arm_estimate(reps[i], arm) else {
            continue;
        };
        errs.push(est - spec.true_outcome_values[arm]);
        if let Some(control) = spec.control {
            if control != arm {
                if let Some(ctrl_est) = arm_estimate(reps[i], control) {
                    let te = est - ctrl_est;
                    let te_true =
                        spec.true_outcome_values[arm] - spec.true_outcome_values[control];
                    errs_te.push(te - te_true);
                }
            }
        }
    }
    let rmse = if errs.is_empty() {
        None
    } else {
        Some((errs.iter().map(|e| e * e).sum::<f64>() / errs.len() as f64).sqrt())
    };
    let mae = if errs.is_empty() {
        None
    } else {
        let abs: Vec<f64> = errs.iter().map(|e| e.abs()).collect();
        Some(median(&abs))
    };
    let rmse_te = if errs_te.is_empty() {
        None
    } else {
        Some((errs_te.iter().map(|e| e * e).sum::<f64>() / errs_te.len() as f64).sqrt())
    };
    let mae_te = if errs_te.is_empty() {
        None
    } else {
        let abs: Vec<f64> = errs_te.iter().map(|e| e.abs()).collect();
        Some(median(&abs))
    };

    BatchSummary {
        n_summarised: n,
        size: DistSummary::from_values(&sizes),
        sum_ys: DistSummary::from_values(&sums),
        prob_superiority: proportion(n_superiority, n),
        prob_equivalence: proportion(n_equivalence, n),
        prob_futility: proportion(n_futility, n),
        prob_max: proportion(count_status(TrialStatus::Max), n),
        prob_conclusive: proportion(n_superiority + n_equivalence + n_futility, n),
        select_probs,
        prob_select_none: proportion(n_none, n),
        rmse,
        mae,
        rmse_te,
        mae_te,
        idp: ideal_design_percentage(spec, &kept, &selections),
    }
}

/// Ideal Design Percentage: where the expected selected-arm outcome sits
/// between the worst and the best true outcome value, on a 0-100 scale
/// (inverted when lower outcomes are desirable).
fn ideal_design_percentage(
    spec: &TrialSpec,
    kept: &[usize],
    selections: &[Option<usize>],
) -> Option<f64> {
    let truth = &spec.true_outcome_values;
    let t_min = truth.iter().cloned().fold(f64::INFINITY, f64::min);
    let t_max = truth.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if t_max - t_min <= 0.0 {
        return None;
    }
    let selected: Vec<f64> = kept
        .iter()
        .filter_map(|&i| selections[i])
        .map(|arm| truth[arm])
        .collect();
    if selected.is_empty() {
        return None;
    }
    let expected = mean(&selected);
    let idp = 100.0 * (expected - t_min) / (t_max - t_min);
    Some(if spec.highest_is_best { idp } else { 100.0 - idp })
}

/// The generator for one bootstrap resample: stream `index` of the boot
/// seed.
fn resample_rng(boot_seed: u64, index: usize) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(boot_seed);
    rng.set_stream(index as u64);
    rng
}

fn bootstrap(
    batch: &TrialBatch,
    cfg: &PerformanceConfig,
    boot: &BootstrapConfig,
    point: &BatchSummary,
) -> BootstrapSummary {
    let n = batch.reps.len();
    let base_rows = point.rows();
    let mut samples: Vec<Vec<f64>> = vec![vec![]; base_rows.len()];

    for b in 0..boot.n_boot {
        let mut rng = resample_rng(boot.boot_seed, b);
        let resample: Vec<&ReplicateResult> = (0..n)
            .map(|_| &batch.reps[rng.gen_range(0..n)])
            .collect();
        let summary = summarise_reps(&batch.spec, &resample, cfg);
        for (slot, (_, value, bootstrappable)) in samples.iter_mut().zip(summary.rows()) {
            if bootstrappable {
                if let Some(v) = value {
                    slot.push(v);
                }
            }
        }
    }

    let half_tail = (1.0 - boot.ci_width) / 2.0;
    let rows = base_rows
        .into_iter()
        .zip(samples)
        .map(|((metric, estimate, bootstrappable), values)| {
            if !bootstrappable || values.is_empty() {
                return MetricUncertainty {
                    metric,
                    estimate,
                    sd: None,
                    robust_sd: None,
                    ci_lower: None,
                    ci_upper: None,
                };
            }
            let spread = sd(&values);
            MetricUncertainty {
                metric,
                estimate,
                sd: if spread.is_finite() { Some(spread) } else { None },
                robust_sd: Some(mad(&values)),
                ci_lower: Some(quantile(&values, half_tail)),
                ci_upper: Some(quantile(&values, 1.0 - half_tail)),
            }
        })
        .collect();

    BootstrapSummary {
        n_boot: boot.n_boot,
        boot_seed: boot.boot_seed,
        ci_width: boot.ci_width,
        rows,
    }
}

/// Reduce a batch to its performance metrics, optionally with bootstrap
/// uncertainty.
pub fn check_performance(batch: &TrialBatch, cfg: &PerformanceConfig) -> PerformanceReport {
    let all: Vec<&ReplicateResult> = batch.reps.iter().collect();
    let estimates = summarise_reps(&batch.spec, &all, cfg);
    let uncertainty = match &cfg.bootstrap {
        Some(boot) if !batch.reps.is_empty() && boot.n_boot > 0 => {
            Some(bootstrap(batch, cfg, boot, &estimates))
        }
        _ => None,
    };
    PerformanceReport {
        estimates,
        uncertainty,
    }
}
