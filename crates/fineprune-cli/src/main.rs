//! fineprune - latency-constrained iterative fine-pruning
//!
//! Alternates Bayesian-optimization search, pruning and fine-tuning while the
//! latency constraint is tightened iteration by iteration.
//!
//! ## Usage
//!
//! - `fineprune`: start a fresh run
//! - `fineprune resume`: continue an interrupted run from its log
//! - `fineprune --thresholds`: print the latency threshold of every iteration
//! - `fineprune --status`: print where `resume` would continue
//!
//! `resume` is the only positional argument; any other value is rejected.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fineprune_core::{resolve_file, Phase, ResumePoint, RunConfig};
use fineprune_phases::{DriveReport, IterationDriver, PhaseExecutor, ProcessExecutor};
use tracing::Level;

#[derive(Parser)]
#[command(name = "fineprune")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Latency-constrained iterative fine-pruning", long_about = None)]
struct Cli {
    /// What to do (default: start a fresh run)
    #[arg(value_enum)]
    action: Option<Action>,

    /// Print the per-iteration latency thresholds and exit
    #[arg(long, conflicts_with_all = ["action", "status"])]
    thresholds: bool,

    /// Print the resolved resume point and exit
    #[arg(long, conflicts_with = "action")]
    status: bool,

    /// Run configuration file (default: ./fineprune.toml when present)
    #[arg(short, long, env = "FINEPRUNE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Continue an interrupted run from its run log
    Resume,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fineprune_core::init_tracing(cli.json, level);

    let config = RunConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if cli.thresholds {
        return cmd_thresholds(&config);
    }
    if cli.status {
        return cmd_status(&config);
    }

    let executor: Arc<dyn PhaseExecutor> = Arc::new(ProcessExecutor::new());
    match cli.action {
        None => cmd_run(config, executor).await,
        Some(Action::Resume) => cmd_resume(config, executor).await,
    }
}

/// Start a fresh run
async fn cmd_run(config: RunConfig, executor: Arc<dyn PhaseExecutor>) -> Result<()> {
    let mut driver =
        IterationDriver::fresh(config, executor).context("Failed to start a fresh run")?;

    println!("Output directory: {}", driver.layout().dir().display());
    println!("Session: {}", driver.session_id());
    println!();

    let report = driver
        .run(ResumePoint::fresh())
        .await
        .context("Fine-pruning stopped; run `fineprune resume` to continue")?;
    print_report(&report);
    Ok(())
}

/// Continue an interrupted run
async fn cmd_resume(config: RunConfig, executor: Arc<dyn PhaseExecutor>) -> Result<()> {
    let (mut driver, resolution) =
        IterationDriver::resume(config, executor).context("Failed to resume run")?;

    println!("Output directory: {}", driver.layout().dir().display());
    println!("Session: {}", driver.session_id());
    println!("Resuming at {}", resolution.point);
    if let Some(failure) = &resolution.last_failure {
        println!(
            "Retrying {} of iteration {} (failed: {})",
            failure.phase, failure.iteration, failure.reason
        );
    }
    println!();

    let report = driver
        .run(resolution.point)
        .await
        .context("Fine-pruning stopped; run `fineprune resume` to continue")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &DriveReport) {
    println!("Iterations completed: {}", report.completed_iterations);
    for phase in Phase::ALL {
        println!("  {:<12} {}ms", phase.name(), report.phase_total_ms(phase));
    }
    if let Some(model) = &report.final_model {
        println!("Final model: {}", model.display());
    }
    println!("Duration: {}ms", report.duration_ms);
}

/// Print the threshold schedule without running anything
fn cmd_thresholds(config: &RunConfig) -> Result<()> {
    let schedule = &config.schedule;
    println!(
        "Schedule: {} ({} -> {} ms over {} iterations)",
        schedule.kind, schedule.original_latency, schedule.final_latency, schedule.total_iterations
    );
    for iteration in 0..schedule.total_iterations {
        println!(
            "  {:>3}: {:>10.2} ms (previous {:.2})",
            iteration,
            schedule.threshold(iteration)?,
            schedule.previous_threshold(iteration)?
        );
    }
    Ok(())
}

/// Print where a resume would continue
fn cmd_status(config: &RunConfig) -> Result<()> {
    let layout = config.layout();
    layout.ensure_resumable().context("No run to report on")?;
    let resolution = resolve_file(&layout.run_log()).context("Failed to read run log")?;

    println!("Output directory: {}", layout.dir().display());
    if resolution.run_completed {
        println!("Status: completed");
    } else {
        println!("Status: resumable at {}", resolution.point);
        if resolution.point.iteration < config.schedule.total_iterations {
            println!(
                "Constraint: {:.2} ms",
                config.schedule.threshold(resolution.point.iteration)?
            );
        }
    }
    if let Some((iteration, phase)) = resolution.last_completed {
        println!("Last completed: {phase} of iteration {iteration}");
    }
    if let Some((iteration, phase)) = resolution.interrupted {
        println!("Interrupted: {phase} of iteration {iteration}");
    }
    if let Some(failure) = &resolution.last_failure {
        println!(
            "Last failure: {} of iteration {}: {}",
            failure.phase, failure.iteration, failure.reason
        );
    }
    println!(
        "Markers: {} ({} ignored as out of order, {} out of range)",
        resolution.markers, resolution.regressions, resolution.out_of_range
    );
    Ok(())
}
