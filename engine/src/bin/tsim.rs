// Trial simulation CLI harness.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use trialsim::batch::{run_trials, BatchConfig, ExecutionMode};
use trialsim::performance::{
    check_performance, BootstrapConfig, PerformanceConfig, SelectionStrategy,
};
use trialsim::spec::TrialDesign;

#[derive(Parser)]
#[command(name = "tsim", about = "Adaptive trial simulation harness", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch of simulated trials and print the replicate records.
    Run {
        /// Trial design JSON file.
        design: PathBuf,
        #[arg(long, default_value_t = 100)]
        n_rep: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Worker threads (0 = sequential).
        #[arg(long, default_value_t = 0)]
        threads: usize,
        /// Record the per-look allocation/status trajectory.
        #[arg(long)]
        history: bool,
    },
    /// Run a batch and print aggregated performance metrics.
    Performance {
        /// Trial design JSON file.
        design: PathBuf,
        #[arg(long, default_value_t = 100)]
        n_rep: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 0)]
        threads: usize,
        /// Arm-selection strategy for non-superiority replicates.
        #[arg(long, default_value = "none")]
        strategy: String,
        /// Bootstrap resamples (0 = no bootstrap).
        #[arg(long, default_value_t = 0)]
        n_boot: usize,
        #[arg(long, default_value_t = 4131)]
        boot_seed: u64,
    },
}

fn load_design(path: &PathBuf) -> Result<trialsim::spec::TrialSpec> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read design file {}", path.display()))?;
    let design: TrialDesign = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse design file {}", path.display()))?;
    design
        .build()
        .with_context(|| format!("invalid trial design in {}", path.display()))
}

fn exec_mode(threads: usize) -> ExecutionMode {
    match threads {
        0 | 1 => ExecutionMode::Sequential,
        n => ExecutionMode::ParallelWith { n_threads: n },
    }
}

fn parse_strategy(name: &str) -> Result<SelectionStrategy> {
    match name {
        "none" => Ok(SelectionStrategy::None),
        "control" => Ok(SelectionStrategy::ControlIfAvailable),
        "best" => Ok(SelectionStrategy::BestRemaining),
        other => anyhow::bail!(
            "unknown selection strategy `{}` (expected none, control, or best)",
            other
        ),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            design,
            n_rep,
            seed,
            threads,
            history,
        } => {
            let spec = load_design(&design)?;
            let model = spec.outcome.model();
            let cfg = BatchConfig::new(n_rep, seed)
                .with_exec(exec_mode(threads))
                .with_full_history(history);
            let batch = run_trials(&spec, model.as_ref(), &cfg)
                .context("batch simulation failed")?;
            println!("{}", batch.to_json()?);
        }
        Command::Performance {
            design,
            n_rep,
            seed,
            threads,
            strategy,
            n_boot,
            boot_seed,
        } => {
            let spec = load_design(&design)?;
            let model = spec.outcome.model();
            let cfg = BatchConfig::new(n_rep, seed).with_exec(exec_mode(threads));
            let batch = run_trials(&spec, model.as_ref(), &cfg)
                .context("batch simulation failed")?;

            let mut perf = PerformanceConfig::default().with_selection(parse_strategy(&strategy)?);
            if n_boot > 0 {
                perf = perf.with_bootstrap(BootstrapConfig::new(n_boot, boot_seed));
            }
            let report = check_performance(&batch, &perf);
            println!("{}", report.to_json()?);
        }
    }

    Ok(())
}
