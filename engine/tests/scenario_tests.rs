//! End-to-end scenario properties of the simulation engine.

use trialsim::batch::{run_trials, BatchConfig};
use trialsim::performance::{check_performance, PerformanceConfig, SelectionStrategy};
use trialsim::replicate::TrialStatus;
use trialsim::spec::{ArmConstraint, RescalePolicy, TrialDesign};

fn arms(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_null_scenario_ends_in_equivalence_or_max() {
    // Three arms with identical true outcome values and an equivalence
    // rule: essentially every replicate must end in equivalence or run to
    // the final look, with superiority a rare false positive.
    let spec = TrialDesign::binomial(
        arms(&["a", "b", "c"]),
        vec![0.25, 0.25, 0.25],
        vec![100, 200],
    )
    .with_equivalence(0.9, 0.05)
    .with_n_draws(500)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(300, 12345)).unwrap();

    let report = check_performance(&batch, &PerformanceConfig::default());
    let s = &report.estimates;
    let superiority = s.prob_superiority.unwrap();
    let inconclusive_or_equal = s.prob_equivalence.unwrap() + s.prob_max.unwrap();
    assert!(superiority < 0.05, "prob_superiority = {}", superiority);
    assert!(
        inconclusive_or_equal > 0.95,
        "prob_equivalence + prob_max = {}",
        inconclusive_or_equal
    );
    // Terminal statuses partition the batch.
    let total = superiority
        + inconclusive_or_equal
        + s.prob_futility.unwrap();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn test_strong_effect_usually_stops_for_superiority() {
    let spec = TrialDesign::binomial(
        arms(&["ctrl", "trt"]),
        vec![0.15, 0.55],
        vec![80, 160, 240],
    )
    .with_control("ctrl")
    .with_n_draws(500)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(100, 42)).unwrap();

    let n_superiority = batch
        .reps
        .iter()
        .filter(|r| r.status == TrialStatus::Superiority)
        .count();
    assert!(n_superiority > 80, "only {}/100 superiority stops", n_superiority);
    for rep in &batch.reps {
        if rep.status == TrialStatus::Superiority {
            assert_eq!(rep.superior_arm.as_deref(), Some("trt"));
        }
    }
}

#[test]
fn test_fixed_arm_allocation_pinned_at_every_look() {
    let spec = TrialDesign::binomial(
        arms(&["a", "b", "c", "d"]),
        vec![0.2, 0.25, 0.3, 0.35],
        vec![60, 120, 180],
    )
    .with_constraints(vec![
        ArmConstraint::pinned(0.3),
        ArmConstraint::free(),
        ArmConstraint::free(),
        ArmConstraint::free(),
    ])
    .with_n_draws(400)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(
        &spec,
        model.as_ref(),
        &BatchConfig::new(20, 11).with_full_history(true),
    )
    .unwrap();

    for rep in &batch.reps {
        for snap in rep.history.as_ref().unwrap() {
            if let Some(p) = snap.allocation[0] {
                assert!(
                    (p - 0.3).abs() < 1e-12,
                    "replicate {} look {}: fixed arm at {}",
                    rep.replicate,
                    snap.look,
                    p
                );
            }
        }
    }
}

#[test]
fn test_soften_zero_equalises_allocation() {
    // With full softening the posterior signal must not move allocation:
    // unconstrained arms split evenly at every look.
    let spec = TrialDesign::binomial(
        arms(&["a", "b", "c"]),
        vec![0.1, 0.3, 0.6],
        vec![50, 100],
    )
    .with_soften_power(0.0)
    .with_n_draws(400)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(
        &spec,
        model.as_ref(),
        &BatchConfig::new(10, 3).with_full_history(true),
    )
    .unwrap();

    for rep in &batch.reps {
        for snap in rep.history.as_ref().unwrap() {
            let active: Vec<f64> = snap.allocation.iter().flatten().copied().collect();
            let expected = 1.0 / active.len() as f64;
            for p in active {
                assert!((p - expected).abs() < 1e-9, "allocation {} != {}", p, expected);
            }
        }
    }
}

#[test]
fn test_soften_one_tracks_best_probabilities() {
    // No softening: the allocation entering look l+1 is proportional to
    // the best probabilities computed at look l.
    let spec = TrialDesign::binomial(
        arms(&["a", "b", "c"]),
        vec![0.2, 0.3, 0.4],
        vec![60, 120, 180],
    )
    .with_superiority(1.0) // keep all looks alive
    .with_inferiority(0.0)
    .with_n_draws(400)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(
        &spec,
        model.as_ref(),
        &BatchConfig::new(5, 21).with_full_history(true),
    )
    .unwrap();

    for rep in &batch.reps {
        let history = rep.history.as_ref().unwrap();
        for looks in history.windows(2) {
            let bp: Vec<f64> = looks[0].best_probs.iter().flatten().copied().collect();
            let next_alloc: Vec<f64> = looks[1].allocation.iter().flatten().copied().collect();
            let bp_sum: f64 = bp.iter().sum();
            if bp.iter().any(|&p| p == 0.0) {
                // A zero weight starves the arm entirely; proportionality
                // still holds but the comparison is degenerate.
                continue;
            }
            for (p, b) in next_alloc.iter().zip(bp.iter()) {
                assert!(
                    (p - b / bp_sum).abs() < 1e-9,
                    "allocation {} not proportional to best prob {}",
                    p,
                    b
                );
            }
        }
    }
}

#[test]
fn test_rescale_limits_tightens_minimums_after_drop() {
    // One clearly inferior arm gets dropped; under the `limits` rescale
    // policy the remaining minimums scale up by the arm-count ratio, so
    // every surviving arm's allocation must clear the raised floor.
    let spec = TrialDesign::binomial(
        arms(&["weak", "mid", "strong"]),
        vec![0.05, 0.4, 0.5],
        vec![80, 160, 240],
    )
    .with_superiority(1.0)
    .with_inferiority(0.02)
    .with_constraints(vec![
        ArmConstraint::limits(Some(0.15), None),
        ArmConstraint::limits(Some(0.15), None),
        ArmConstraint::limits(Some(0.15), None),
    ])
    .with_rescale_policy(RescalePolicy::Limits)
    .with_n_draws(500)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(
        &spec,
        model.as_ref(),
        &BatchConfig::new(20, 5).with_full_history(true),
    )
    .unwrap();

    let mut saw_drop = false;
    for rep in &batch.reps {
        let history = rep.history.as_ref().unwrap();
        for snap in history {
            let active: Vec<f64> = snap.allocation.iter().flatten().copied().collect();
            if active.len() == 2 {
                saw_drop = true;
                // 3 arms -> 2 arms: minimums rescale 0.15 * 3/2 = 0.225.
                for p in active {
                    assert!(p >= 0.225 - 1e-9, "allocation {} below raised floor", p);
                }
            }
        }
    }
    assert!(saw_drop, "no replicate dropped an arm; scenario miscalibrated");
}

#[test]
fn test_selection_and_error_metrics_populated() {
    let spec = TrialDesign::binomial(
        arms(&["ctrl", "trt_a", "trt_b"]),
        vec![0.2, 0.3, 0.4],
        vec![80, 160],
    )
    .with_control("ctrl")
    .with_n_draws(400)
    .build()
    .unwrap();
    let model = spec.outcome.model();
    let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(60, 8)).unwrap();

    let report = check_performance(
        &batch,
        &PerformanceConfig::default().with_selection(SelectionStrategy::BestRemaining),
    );
    let s = &report.estimates;
    assert_eq!(s.n_summarised, 60);
    // Every replicate selects an arm under best-remaining.
    assert_eq!(s.prob_select_none, Some(0.0));
    let select_total: f64 = s.select_probs.iter().filter_map(|(_, p)| *p).sum();
    assert!((select_total - 1.0).abs() < 1e-9);
    assert!(s.rmse.is_some());
    assert!(s.mae.is_some());
    assert!(s.idp.is_some());
    let idp = s.idp.unwrap();
    assert!((0.0..=100.0).contains(&idp));
}
