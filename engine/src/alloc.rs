//! Allocation-probability transform.
//!
//! Maps per-arm best probabilities plus constraints into a valid
//! allocation distribution over the active arms: control policy first,
//! then softened RAR weights over the remaining mass, then fixed/min/max
//! enforcement by clamping and redistributing slack until a fixed point.
//! Validated constraints guarantee a fixed point exists; running out of
//! iterations is therefore an engine bug, not a user error.

use crate::error::InvariantError;
use crate::spec::{ArmConstraint, ControlPolicy};

const MAX_ITER: usize = 100;
const TOL: f64 = 1e-9;
const SUM_TOL: f64 = 1e-6;

/// Inputs for one allocation update.
pub struct AllocInput<'a> {
    /// Active arm indices, in arm order.
    pub active: &'a [usize],
    /// Best-arm probability per active arm, aligned with `active`.
    pub best_probs: &'a [f64],
    /// Constraint per arm (indexed by arm, not by position).
    pub constraints: &'a [ArmConstraint],
    /// Current control arm index, if any.
    pub control: Option<usize>,
    pub policy: ControlPolicy,
    /// Softening exponent for this look.
    pub soften: f64,
    /// Frozen control share for the `sqrt-based-start` policy.
    pub sqrt_start_share: Option<f64>,
}

/// Control share under the square-root allocation rule: ratio sqrt(k) : 1
/// against each of k non-control arms under an equal split.
pub fn sqrt_control_share(n_noncontrol: usize) -> f64 {
    let k = n_noncontrol as f64;
    if k <= 0.0 {
        return 1.0;
    }
    k.sqrt() / (k.sqrt() + k)
}

/// Compute the next allocation distribution over the active arms.
/// Returns one probability per entry of `input.active`.
pub fn update_allocation(input: &AllocInput) -> Result<Vec<f64>, InvariantError> {
    let n = input.active.len();
    if n == 0 {
        return Ok(vec![]);
    }
    if n == 1 {
        return Ok(vec![1.0]);
    }

    let control_pos = input
        .control
        .and_then(|c| input.active.iter().position(|&a| a == c));

    let probs = match (input.policy, control_pos) {
        // Control under ordinary RAR (or no control at all).
        (ControlPolicy::None, _) | (_, None) => {
            let weights = rar_weights(input.best_probs, input.soften);
            distribute(1.0, input.active, &weights, input.constraints)?
        }
        (ControlPolicy::Match, Some(cp)) => match_allocation(input, cp)?,
        (policy, Some(cp)) => {
            let k = n - 1;
            let control_share = match policy {
                // Validated at build time to carry a fixed constraint.
                ControlPolicy::Fixed => input.constraints[input.active[cp]]
                    .fixed
                    .unwrap_or(0.0),
                ControlPolicy::SqrtBased | ControlPolicy::SqrtBasedFixed => {
                    sqrt_control_share(k)
                }
                ControlPolicy::SqrtBasedStart => input
                    .sqrt_start_share
                    .unwrap_or_else(|| sqrt_control_share(k)),
                ControlPolicy::None | ControlPolicy::Match => unreachable!(),
            };

            let noncontrol: Vec<usize> = input
                .active
                .iter()
                .copied()
                .filter(|&a| Some(a) != input.control)
                .collect();
            let weights = if policy == ControlPolicy::SqrtBasedFixed {
                // Off RAR: the non-control mass splits evenly.
                vec![1.0; noncontrol.len()]
            } else {
                let nc_probs: Vec<f64> = input
                    .best_probs
                    .iter()
                    .enumerate()
                    .filter(|&(pos, _)| pos != cp)
                    .map(|(_, &p)| p)
                    .collect();
                rar_weights(&nc_probs, input.soften)
            };
            let nc_alloc = distribute(
                1.0 - control_share,
                &noncontrol,
                &weights,
                input.constraints,
            )?;

            let mut probs = Vec::with_capacity(n);
            let mut nc_iter = nc_alloc.into_iter();
            for pos in 0..n {
                if pos == cp {
                    probs.push(control_share);
                } else {
                    probs.push(nc_iter.next().unwrap_or(0.0));
                }
            }
            probs
        }
    };

    let sum: f64 = probs.iter().sum();
    if (sum - 1.0).abs() > SUM_TOL {
        return Err(InvariantError::AllocationSum { sum });
    }
    Ok(probs)
}

/// Softened RAR weights. A zero exponent equalises the pool regardless of
/// signal; an all-zero signal also falls back to equal weights.
fn rar_weights(best_probs: &[f64], soften: f64) -> Vec<f64> {
    let weights: Vec<f64> = best_probs.iter().map(|&p| p.powf(soften)).collect();
    if weights.iter().sum::<f64>() <= 0.0 {
        vec![1.0; best_probs.len()]
    } else {
        weights
    }
}

/// `match` policy: give the non-control arms a full RAR distribution,
/// mirror its maximum onto the control, then renormalise everything.
fn match_allocation(input: &AllocInput, cp: usize) -> Result<Vec<f64>, InvariantError> {
    let noncontrol: Vec<usize> = input
        .active
        .iter()
        .copied()
        .filter(|&a| Some(a) != input.control)
        .collect();
    let nc_probs: Vec<f64> = input
        .best_probs
        .iter()
        .enumerate()
        .filter(|&(pos, _)| pos != cp)
        .map(|(_, &p)| p)
        .collect();
    let weights = rar_weights(&nc_probs, input.soften);
    let nc_alloc = distribute(1.0, &noncontrol, &weights, input.constraints)?;

    let control_share = nc_alloc.iter().cloned().fold(0.0_f64, f64::max);
    let total = 1.0 + control_share;

    let mut probs = Vec::with_capacity(input.active.len());
    let mut nc_iter = nc_alloc.into_iter();
    for pos in 0..input.active.len() {
        if pos == cp {
            probs.push(control_share / total);
        } else {
            probs.push(nc_iter.next().unwrap_or(0.0) / total);
        }
    }
    Ok(probs)
}

/// Distribute `mass` across `arms`: fixed arms take their pinned value,
/// the rest take weight-proportional shares clamped into [min, max] with
/// slack redistributed among the still-unclamped arms.
fn distribute(
    mass: f64,
    arms: &[usize],
    weights: &[f64],
    constraints: &[ArmConstraint],
) -> Result<Vec<f64>, InvariantError> {
    let m = arms.len();
    let mut value = vec![0.0_f64; m];
    let mut pinned = vec![false; m];

    let mut fixed_sum = 0.0;
    for (i, &arm) in arms.iter().enumerate() {
        if let Some(f) = constraints[arm].fixed {
            value[i] = f;
            pinned[i] = true;
            fixed_sum += f;
        }
    }
    if fixed_sum > mass + SUM_TOL {
        return Err(InvariantError::MassExhausted {
            required: fixed_sum,
            available: mass,
        });
    }

    for _ in 0..MAX_ITER {
        let pinned_sum: f64 = (0..m).filter(|&i| pinned[i]).map(|i| value[i]).sum();
        let remaining = mass - pinned_sum;
        if remaining < -SUM_TOL {
            return Err(InvariantError::MassExhausted {
                required: pinned_sum,
                available: mass,
            });
        }

        let free: Vec<usize> = (0..m).filter(|&i| !pinned[i]).collect();
        if free.is_empty() {
            break;
        }
        let w_sum: f64 = free.iter().map(|&i| weights[i]).sum();
        for &i in &free {
            value[i] = if w_sum > 0.0 {
                remaining * weights[i] / w_sum
            } else {
                remaining / free.len() as f64
            };
        }

        let mut changed = false;
        for &i in &free {
            let c = &constraints[arms[i]];
            if let Some(min) = c.min {
                if value[i] < min - TOL {
                    value[i] = min;
                    pinned[i] = true;
                    changed = true;
                    continue;
                }
            }
            if let Some(max) = c.max {
                if value[i] > max + TOL {
                    value[i] = max;
                    pinned[i] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(value);
        }
    }

    // All arms pinned: the values must already account for the mass.
    let total: f64 = value.iter().sum();
    if (total - mass).abs() > SUM_TOL {
        return Err(InvariantError::RedistributionDiverged {
            iterations: MAX_ITER,
        });
    }
    Ok(value)
}

/// Proportionally rescale fixed values and/or min-max limits after arms
/// were dropped, preserving relative emphasis instead of letting freed
/// mass flow arbitrarily. Scaled values are capped at 1.
pub fn rescale_constraints(
    constraints: &mut [ArmConstraint],
    policy: crate::spec::RescalePolicy,
    n_before: usize,
    n_after: usize,
) {
    if n_after == 0 || n_after >= n_before {
        return;
    }
    let ratio = n_before as f64 / n_after as f64;
    for c in constraints.iter_mut() {
        if policy.rescales_fixed() {
            if let Some(f) = c.fixed.as_mut() {
                *f = (*f * ratio).min(1.0);
            }
        }
        if policy.rescales_limits() {
            if let Some(min) = c.min.as_mut() {
                *min = (*min * ratio).min(1.0);
            }
            if let Some(max) = c.max.as_mut() {
                *max = (*max * ratio).min(1.0);
            }
        }
    }
}
