//! Batch orchestration of independent replicates.
//!
//! Replicate `i` always consumes stream `i` of a ChaCha20 generator
//! seeded with the batch's base seed, so the set of per-replicate results
//! is identical regardless of worker count or completion order. Workers
//! share nothing mutable; the only synchronisation point is collecting
//! their results before returning.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::SimError;
use crate::model::OutcomeModel;
use crate::replicate::{ReplicateEngine, ReplicateResult};
use crate::spec::TrialSpec;

/// How replicates are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Run everything on the calling thread.
    Sequential,
    /// Scoped worker threads, one per available core.
    Parallel,
    /// Scoped worker threads with an explicit count.
    ParallelWith { n_threads: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

impl ExecutionMode {
    fn worker_count(&self) -> usize {
        match self {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            ExecutionMode::ParallelWith { n_threads } => (*n_threads).max(1),
        }
    }
}

/// Batch execution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub n_rep: usize,
    pub base_seed: u64,
    #[serde(default)]
    pub exec: ExecutionMode,
    /// Record the allocation/status trajectory at every look.
    #[serde(default)]
    pub full_history: bool,
}

impl BatchConfig {
    pub fn new(n_rep: usize, base_seed: u64) -> Self {
        Self {
            n_rep,
            base_seed,
            exec: ExecutionMode::default(),
            full_history: false,
        }
    }

    pub fn with_exec(mut self, exec: ExecutionMode) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_full_history(mut self, full_history: bool) -> Self {
        self.full_history = full_history;
        self
    }
}

/// Ordered results of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialBatch {
    pub spec: TrialSpec,
    /// Replicate records in replicate-index order (1..n_rep).
    pub reps: Vec<ReplicateResult>,
    pub base_seed: u64,
    pub elapsed_secs: f64,
}

impl TrialBatch {
    pub fn n_rep(&self) -> usize {
        self.reps.len()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The generator for one replicate: stream `index` of the base seed.
pub fn replicate_rng(base_seed: u64, index: usize) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(base_seed);
    rng.set_stream(index as u64);
    rng
}

fn run_one(
    spec: &TrialSpec,
    model: &dyn OutcomeModel,
    cfg: &BatchConfig,
    index: usize,
) -> Result<ReplicateResult, SimError> {
    let rng = replicate_rng(cfg.base_seed, index);
    ReplicateEngine::new(spec, model, rng, cfg.full_history).run(index + 1)
}

/// Run `n_rep` independent replicates of one specification.
///
/// A single replicate failure aborts the whole batch: silently dropping
/// a replicate would bias every aggregate statistic. The error reported
/// is always the one with the lowest replicate index.
pub fn run_trials(
    spec: &TrialSpec,
    model: &dyn OutcomeModel,
    cfg: &BatchConfig,
) -> Result<TrialBatch, SimError> {
    let start = Instant::now();
    let n_rep = cfg.n_rep;
    let workers = cfg.exec.worker_count().min(n_rep.max(1));

    let results: Vec<Result<ReplicateResult, SimError>> = if workers <= 1 {
        (0..n_rep).map(|i| run_one(spec, model, cfg, i)).collect()
    } else {
        let chunk = (n_rep + workers - 1) / workers;
        let mut slots: Vec<Option<Result<ReplicateResult, SimError>>> =
            (0..n_rep).map(|_| None).collect();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let lo = w * chunk;
                    let hi = ((w + 1) * chunk).min(n_rep);
                    scope.spawn(move || {
                        (lo..hi)
                            .map(|i| (i, run_one(spec, model, cfg, i)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(chunk_results) => {
                        for (i, r) in chunk_results {
                            slots[i] = Some(r);
                        }
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });
        slots.into_iter().flatten().collect()
    };

    let mut reps = Vec::with_capacity(n_rep);
    for result in results {
        reps.push(result?);
    }

    Ok(TrialBatch {
        spec: spec.clone(),
        reps,
        base_seed: cfg.base_seed,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TrialDesign;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn small_spec() -> TrialSpec {
        TrialDesign::binomial(
            arms(&["a", "b", "c"]),
            vec![0.2, 0.25, 0.3],
            vec![40, 80],
        )
        .with_n_draws(300)
        .build()
        .unwrap()
    }

    #[test]
    fn test_batch_is_ordered_and_complete() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(8, 42)).unwrap();
        assert_eq!(batch.n_rep(), 8);
        for (i, rep) in batch.reps.iter().enumerate() {
            assert_eq!(rep.replicate, i + 1);
            assert!(rep.status.is_terminal());
        }
    }

    #[test]
    fn test_batch_reproducible_across_runs() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let cfg = BatchConfig::new(6, 12345);
        let b1 = run_trials(&spec, model.as_ref(), &cfg).unwrap();
        let b2 = run_trials(&spec, model.as_ref(), &cfg).unwrap();
        assert_eq!(b1.reps, b2.reps);
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let seq = run_trials(&spec, model.as_ref(), &BatchConfig::new(10, 7)).unwrap();
        let par = run_trials(
            &spec,
            model.as_ref(),
            &BatchConfig::new(10, 7).with_exec(ExecutionMode::ParallelWith { n_threads: 4 }),
        )
        .unwrap();
        assert_eq!(seq.reps, par.reps);
    }

    #[test]
    fn test_replicate_streams_differ() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(2, 99)).unwrap();
        // Different streams must not replay the same trial.
        assert_ne!(batch.reps[0].arms, batch.reps[1].arms);
    }

    #[test]
    fn test_empty_batch_is_allowed() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(0, 1)).unwrap();
        assert_eq!(batch.n_rep(), 0);
    }

    #[test]
    fn test_batch_json_round_trip() {
        let spec = small_spec();
        let model = spec.outcome.model();
        let batch = run_trials(&spec, model.as_ref(), &BatchConfig::new(2, 5)).unwrap();
        let json = batch.to_json_compact().unwrap();
        let back: TrialBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(batch.reps, back.reps);
        assert_eq!(batch.base_seed, back.base_seed);
    }
}
