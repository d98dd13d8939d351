//! Interim-analysis decision rules.
//!
//! One evaluation per look: derive each active arm's probability of being
//! best from the posterior draw matrices, then walk the rule cascade in
//! fixed order: superiority, inferiority, equivalence, futility, max.
//! All drops decided within a look are applied simultaneously afterwards;
//! no rule depends on an ordering among same-look drops.

use crate::replicate::{ArmStatus, TrialStatus};
use crate::spec::{MarginRule, TrialSpec};

/// Inputs for one look's evaluation.
pub struct StoppingInput<'a> {
    /// Posterior draws, one vector of `n_draws` samples per active arm.
    pub draws: &'a [Vec<f64>],
    /// Arm indices corresponding to `draws`, in arm order.
    pub active: &'a [usize],
    /// Currently active control arm, if any.
    pub control: Option<usize>,
    /// Whether the current control is the trial's original control.
    pub control_is_original: bool,
    /// Zero-based look index.
    pub look: usize,
    pub is_last_look: bool,
}

/// Outcome of one look's evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct LookDecision {
    /// Probability of being the best arm, aligned with the active set.
    pub best_probs: Vec<f64>,
    /// `Active` unless the look terminated the trial.
    pub trial_status: TrialStatus,
    /// Arm declared superior, when `trial_status == Superiority`.
    pub superior_arm: Option<usize>,
    /// Arms dropped this look with their terminal status.
    pub drops: Vec<(usize, ArmStatus)>,
}

/// Empirical probability that each arm is the extremal one across draws.
/// Ties within a draw resolve to the lowest arm index.
pub fn best_probabilities(draws: &[Vec<f64>], highest_is_best: bool) -> Vec<f64> {
    let n_arms = draws.len();
    if n_arms == 0 {
        return vec![];
    }
    let n_draws = draws[0].len();
    let mut wins = vec![0usize; n_arms];

    for j in 0..n_draws {
        let mut best = 0usize;
        for i in 1..n_arms {
            let better = if highest_is_best {
                draws[i][j] > draws[best][j]
            } else {
                draws[i][j] < draws[best][j]
            };
            if better {
                best = i;
            }
        }
        wins[best] += 1;
    }

    wins.iter().map(|&w| w as f64 / n_draws as f64).collect()
}

/// Evaluate the full rule cascade for one look.
pub fn evaluate_look(spec: &TrialSpec, input: &StoppingInput) -> LookDecision {
    let best_probs = best_probabilities(input.draws, spec.highest_is_best);
    let mut decision = LookDecision {
        best_probs,
        trial_status: TrialStatus::Active,
        superior_arm: None,
        drops: vec![],
    };

    check_superiority(spec, input, &mut decision);
    if decision.trial_status != TrialStatus::Active {
        return decision;
    }

    check_inferiority(spec, input, &mut decision);
    check_margin_rule(spec, input, &mut decision, RuleKind::Equivalence);
    if decision.trial_status != TrialStatus::Active {
        return decision;
    }
    check_margin_rule(spec, input, &mut decision, RuleKind::Futility);
    if decision.trial_status != TrialStatus::Active {
        return decision;
    }

    if input.is_last_look {
        decision.trial_status = TrialStatus::Max;
    }
    decision
}

fn position_of(active: &[usize], arm: usize) -> Option<usize> {
    active.iter().position(|&a| a == arm)
}

fn check_superiority(spec: &TrialSpec, input: &StoppingInput, decision: &mut LookDecision) {
    let threshold = spec.superiority[input.look];
    let candidates: Vec<usize> = input
        .active
        .iter()
        .enumerate()
        .filter(|&(_, &arm)| Some(arm) != input.control)
        .filter(|&(pos, _)| decision.best_probs[pos] > threshold)
        .map(|(pos, _)| pos)
        .collect();

    if candidates.len() != 1 {
        return;
    }
    let pos = candidates[0];

    if let Some(control) = input.control {
        let control_pos = match position_of(input.active, control) {
            Some(p) => p,
            None => return,
        };
        if decision.best_probs[pos] <= decision.best_probs[control_pos] {
            return;
        }
    }

    decision.trial_status = TrialStatus::Superiority;
    decision.superior_arm = Some(input.active[pos]);
}

fn check_inferiority(spec: &TrialSpec, input: &StoppingInput, decision: &mut LookDecision) {
    let threshold = spec.inferiority[input.look];
    let qualifying: Vec<usize> = input
        .active
        .iter()
        .enumerate()
        .filter(|&(_, &arm)| Some(arm) != input.control)
        .filter(|&(pos, _)| decision.best_probs[pos] < threshold)
        .map(|(pos, _)| input.active[pos])
        .collect();

    // Inferiority never terminates a trial: suppressed outright when the
    // drops would leave fewer than two arms.
    if qualifying.is_empty() || input.active.len() - qualifying.len() < 2 {
        return;
    }
    for arm in qualifying {
        decision.drops.push((arm, ArmStatus::DroppedInferiority));
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RuleKind {
    Equivalence,
    Futility,
}

impl RuleKind {
    fn rule(self, spec: &TrialSpec) -> Option<&MarginRule> {
        match self {
            RuleKind::Equivalence => spec.equivalence.as_ref(),
            RuleKind::Futility => spec.futility.as_ref(),
        }
    }

    fn dropped_status(self) -> ArmStatus {
        match self {
            RuleKind::Equivalence => ArmStatus::DroppedEquivalence,
            RuleKind::Futility => ArmStatus::DroppedFutility,
        }
    }

    fn terminal_status(self) -> TrialStatus {
        match self {
            RuleKind::Equivalence => TrialStatus::Equivalence,
            RuleKind::Futility => TrialStatus::Futility,
        }
    }
}

fn check_margin_rule(
    spec: &TrialSpec,
    input: &StoppingInput,
    decision: &mut LookDecision,
    kind: RuleKind,
) {
    let Some(rule) = kind.rule(spec) else {
        return;
    };
    let threshold = rule.probs[input.look];
    let n_draws = input.draws[0].len();

    let already_dropped: Vec<usize> = decision.drops.iter().map(|&(arm, _)| arm).collect();
    let remaining: Vec<usize> = (0..input.active.len())
        .filter(|&pos| !already_dropped.contains(&input.active[pos]))
        .collect();

    match input.control {
        None => {
            // Futility is only defined against a control.
            if kind == RuleKind::Futility || remaining.len() < 2 {
                return;
            }
            // Joint test: all remaining arms within the margin of each
            // other terminates the whole trial.
            let mut within = 0usize;
            for j in 0..n_draws {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &pos in &remaining {
                    let d = input.draws[pos][j];
                    lo = lo.min(d);
                    hi = hi.max(d);
                }
                if hi - lo < rule.diff {
                    within += 1;
                }
            }
            if within as f64 / n_draws as f64 > threshold {
                decision.trial_status = kind.terminal_status();
                for &pos in &remaining {
                    decision
                        .drops
                        .push((input.active[pos], kind.dropped_status()));
                }
            }
        }
        Some(control) => {
            if rule.only_first && !input.control_is_original {
                return;
            }
            let Some(control_pos) = position_of(input.active, control) else {
                return;
            };

            let mut qualifying = vec![];
            let mut n_compared = 0usize;
            for &pos in &remaining {
                if pos == control_pos {
                    continue;
                }
                n_compared += 1;
                let mut within = 0usize;
                for j in 0..n_draws {
                    let delta = input.draws[pos][j] - input.draws[control_pos][j];
                    let hit = match kind {
                        RuleKind::Equivalence => delta.abs() < rule.diff,
                        // Futile: the arm is not beating the control by
                        // more than the margin.
                        RuleKind::Futility => {
                            if spec.highest_is_best {
                                delta < rule.diff
                            } else {
                                delta > -rule.diff
                            }
                        }
                    };
                    if hit {
                        within += 1;
                    }
                }
                if within as f64 / n_draws as f64 > threshold {
                    qualifying.push(input.active[pos]);
                }
            }

            if qualifying.is_empty() {
                return;
            }
            // Dropping every compared arm leaves nothing to randomise
            // against: the trial ends with this rule's terminal status.
            if qualifying.len() == n_compared {
                decision.trial_status = kind.terminal_status();
            }
            for arm in qualifying {
                decision.drops.push((arm, kind.dropped_status()));
            }
        }
    }
}
