//! The resumable fine-pruning loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fineprune_core::obs::{
    emit_candidate_selected, emit_iteration_started, emit_phase_completed, emit_phase_failed,
    emit_phase_started, emit_run_finished, emit_run_resumed, emit_run_started,
};
use fineprune_core::{
    load_records, resolve_file, run_span, select_best, select_fastest, FinepruneError,
    NoFeasiblePolicy, OptimizerMode, OutputLayout, Phase, Resolution, ResultRecord, ResumePoint,
    RunConfig, RunEvent, RunLog,
};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{DriverError, Result};
use crate::handoff::write_pruning_config;
use crate::invocation::{
    FinetuneParams, OptimizeParams, PhaseInvocation, PruneParams, UnconstrainedOptimizeParams,
};
use crate::runner::{ExecError, PhaseExecutor};

/// Wall-clock time of one completed phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTiming {
    pub iteration: u32,
    pub phase: Phase,
    pub duration_ms: u64,
}

/// What one invocation of the driver accomplished.
#[derive(Debug, Clone)]
pub struct DriveReport {
    /// Session id written to the run log.
    pub session_id: String,

    /// Where this invocation entered the loop.
    pub started_at: ResumePoint,

    /// Phases completed by this invocation, in order.
    pub phases: Vec<PhaseTiming>,

    /// Iterations finished by this invocation.
    pub completed_iterations: u32,

    /// Fine-tuned model of the last finished iteration.
    pub final_model: Option<PathBuf>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl DriveReport {
    /// Sum of phase durations for `phase` across iterations.
    pub fn phase_total_ms(&self, phase: Phase) -> u64 {
        self.phases
            .iter()
            .filter(|t| t.phase == phase)
            .map(|t| t.duration_ms)
            .sum()
    }
}

/// Drives optimization, pruning and fine-tuning for every iteration of a run.
///
/// The driver is the only writer of the run log. Phases run one at a time.
pub struct IterationDriver {
    config: Arc<RunConfig>,
    layout: OutputLayout,
    executor: Arc<dyn PhaseExecutor>,
    log: RunLog,
    session_id: String,
    /// Whether the run log already holds `RunCompleted`.
    run_completed: bool,
}

impl IterationDriver {
    /// Start a new run. Fails if its output directory already exists.
    pub fn fresh(config: RunConfig, executor: Arc<dyn PhaseExecutor>) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        layout.create_fresh()?;

        let mut driver = Self::open(config, layout, executor)?;
        driver.write_header()?;
        Ok(driver)
    }

    /// Reopen an interrupted run and resolve where it continues.
    pub fn resume(
        config: RunConfig,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Result<(Self, Resolution)> {
        config.validate()?;
        let layout = config.layout();
        layout.ensure_resumable()?;
        let resolution = resolve_file(&layout.run_log())?;

        let mut driver = Self::open(config, layout, executor)?;
        driver.run_completed = resolution.run_completed;
        let digest = driver.config.digest()?;
        if let Some(recorded) = &resolution.config_digest {
            if *recorded != digest {
                warn!(
                    recorded = %recorded,
                    current = %digest,
                    "configuration changed since the run started"
                );
                driver
                    .log
                    .warn("Configuration differs from the one this run was started with")?;
            }
        }
        if let Some(failure) = &resolution.last_failure {
            info!(
                iteration = failure.iteration,
                phase = %failure.phase,
                reason = %failure.reason,
                "retrying failed phase"
            );
        }

        driver.log.record(&RunEvent::RunResumed {
            session_id: driver.session_id.clone(),
            iteration: resolution.point.iteration,
            next_phase: resolution.point.next_phase,
        })?;
        driver.log.info(&format!("Resuming at {}", resolution.point))?;
        emit_run_resumed(&resolution.point);

        Ok((driver, resolution))
    }

    fn open(
        config: RunConfig,
        layout: OutputLayout,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Result<Self> {
        let log = RunLog::open(layout.run_log())?;
        Ok(Self {
            config: Arc::new(config),
            layout,
            executor,
            log,
            session_id: Uuid::new_v4().to_string(),
            run_completed: false,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let schedule = &self.config.schedule;
        let signature = self.config.signature();
        let thresholds = schedule
            .thresholds()?
            .iter()
            .map(|t| format!("{t:.2}"))
            .collect::<Vec<_>>()
            .join(", ");

        self.log.info(&format!("Fine-pruning run {signature}"))?;
        self.log
            .info(&format!("Original latency: {}", schedule.original_latency))?;
        self.log
            .info(&format!("Target latency: {}", schedule.final_latency))?;
        self.log.info(&format!(
            "Relaxation schedule: {} over {} iterations, thresholds [{thresholds}]",
            schedule.kind, schedule.total_iterations
        ))?;
        self.log.record(&RunEvent::RunStarted {
            session_id: self.session_id.clone(),
            signature: signature.clone(),
            config_digest: self.config.digest()?,
            schedule: schedule.kind,
            original_latency: schedule.original_latency,
            final_latency: schedule.final_latency,
            total_iterations: schedule.total_iterations,
        })?;
        emit_run_started(&signature, schedule.total_iterations);
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every remaining phase starting at `from`.
    ///
    /// Stops at the first failing phase after logging `PhaseFailed`; the run
    /// can then be resumed.
    pub async fn run(&mut self, from: ResumePoint) -> Result<DriveReport> {
        let span = run_span(&self.session_id, &self.config.signature());
        self.drive(from).instrument(span).await
    }

    async fn drive(&mut self, from: ResumePoint) -> Result<DriveReport> {
        let start = Instant::now();
        let total = self.config.schedule.total_iterations;

        let mut report = DriveReport {
            session_id: self.session_id.clone(),
            started_at: from,
            phases: Vec::new(),
            completed_iterations: 0,
            final_model: None,
            duration_ms: 0,
        };

        if from.iteration >= total {
            info!(iterations = total, "all iterations already completed");
            report.final_model = Some(self.layout.finetuned_model(total.saturating_sub(1)));
            // The previous process may have died between the last completion and this marker.
            if !self.run_completed {
                self.complete(total)?;
            }
            return Ok(report);
        }

        for iteration in from.iteration..total {
            let entry = if iteration == from.iteration {
                from.entry_phase()
            } else {
                Phase::Optimization
            };

            for phase in Phase::ALL.into_iter().filter(|p| *p >= entry) {
                let duration_ms = self.execute_phase(iteration, phase).await?;
                report.phases.push(PhaseTiming {
                    iteration,
                    phase,
                    duration_ms,
                });
            }

            report.completed_iterations += 1;
            report.final_model = Some(self.layout.finetuned_model(iteration));
        }

        self.complete(total)?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        emit_run_finished(total, report.duration_ms);
        Ok(report)
    }

    fn complete(&mut self, total: u32) -> Result<()> {
        self.log.record(&RunEvent::RunCompleted { iterations: total })?;
        self.run_completed = true;
        Ok(())
    }

    /// Run one phase between its start and completion (or failure) markers.
    async fn execute_phase(&mut self, iteration: u32, phase: Phase) -> Result<u64> {
        if phase == Phase::Optimization {
            let constraint = self.config.schedule.threshold(iteration)?;
            self.log.record(&RunEvent::IterationStarted {
                iteration,
                constraint,
            })?;
            self.log.info(&format!(
                "Iteration {iteration}: latency constraint {constraint:.2} ms"
            ))?;
            emit_iteration_started(iteration, constraint);
        }

        self.log.record(&RunEvent::PhaseStarted { iteration, phase })?;
        emit_phase_started(iteration, phase);
        let started = Instant::now();

        let result = match phase {
            Phase::Optimization => self.optimize(iteration).await,
            Phase::Pruning => self.prune(iteration).await,
            Phase::FineTuning => self.finetune(iteration).await,
        };

        match result {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.log.record(&RunEvent::PhaseCompleted {
                    iteration,
                    phase,
                    duration_ms,
                })?;
                emit_phase_completed(iteration, phase, duration_ms);
                Ok(duration_ms)
            }
            Err(err) => {
                if err.is_iteration_failure() {
                    self.log.record(&RunEvent::PhaseFailed {
                        iteration,
                        phase,
                        reason: err.to_string(),
                    })?;
                    emit_phase_failed(iteration, phase, &err);
                }
                Err(err)
            }
        }
    }

    async fn optimize(&mut self, iteration: u32) -> Result<()> {
        let schedule = &self.config.schedule;
        let search = OptimizeParams {
            iterations: self.config.optimizer.iterations,
            init_samples: self.config.optimizer.init_samples,
            input_model: self.config.input_model(iteration),
            previous_constraint: schedule.previous_threshold(iteration)?,
            current_constraint: schedule.threshold(iteration)?,
            output_prefix: self.layout.optimizer_prefix(iteration),
            original_latency: schedule.original_latency,
        };
        let optimizer = &self.config.optimizer;
        let result_log = self.layout.result_log(iteration);

        let invocation = match optimizer.mode {
            OptimizerMode::Constrained => search.invocation(iteration, optimizer, result_log),
            OptimizerMode::Unconstrained => {
                let latency_tradeoff = self.config.latency_tradeoff(iteration)?;
                debug!(iteration, latency_tradeoff, "unconstrained optimization");
                self.log.info(&format!(
                    "Iteration {iteration}: latency tradeoff factor {latency_tradeoff:.4}"
                ))?;
                UnconstrainedOptimizeParams {
                    search,
                    latency_tradeoff,
                    kappa: optimizer.kappa,
                }
                .invocation(iteration, optimizer, result_log)
            }
        };
        self.invoke(&invocation).await
    }

    async fn prune(&mut self, iteration: u32) -> Result<()> {
        let constraint = self.config.schedule.threshold(iteration)?;
        let records = load_records(&self.layout.result_log(iteration))?;
        debug!(iteration, candidates = records.len(), "loaded optimizer results");

        let (chosen, feasible) = self.choose_candidate(&records, iteration, constraint)?;

        let handoff = self.layout.pruning_config();
        write_pruning_config(&handoff, &chosen.pruning_config)?;
        self.log.record(&RunEvent::CandidateSelected {
            iteration,
            latency: chosen.latency,
            accuracy: chosen.accuracy,
            feasible,
            pruning_config: chosen.pruning_config.clone(),
        })?;
        emit_candidate_selected(iteration, chosen.latency, chosen.accuracy, feasible);

        let params = PruneParams {
            input_model: self.config.input_model(iteration),
            architecture_spec: self.config.paths.architecture_spec.clone(),
            output_model: self.layout.best_sampled_model(),
            pruning_config_file: handoff,
        };
        self.invoke(&params.invocation(iteration, &self.config.pruner)).await
    }

    /// Best feasible record, or the configured fallback when there is none.
    fn choose_candidate(
        &self,
        records: &[ResultRecord],
        iteration: u32,
        constraint: f64,
    ) -> Result<(ResultRecord, bool)> {
        if let Some(best) = select_best(records, constraint) {
            return Ok((best.clone(), true));
        }

        let no_feasible = FinepruneError::NoFeasibleCandidate {
            iteration,
            constraint,
        };
        match self.config.selection.no_feasible {
            NoFeasiblePolicy::Abort => Err(no_feasible.into()),
            NoFeasiblePolicy::Fastest => match select_fastest(records) {
                Some(fastest) => Ok((fastest.clone(), false)),
                None => Err(no_feasible.into()),
            },
        }
    }

    async fn finetune(&self, iteration: u32) -> Result<()> {
        let params = FinetuneParams {
            input_model: self.layout.best_sampled_model(),
            training_config: self.config.paths.training_config.clone(),
            output_model: self.layout.finetuned_model(iteration),
            min_accuracy: self.config.finetuner.min_accuracy,
            max_training_steps: self.config.finetuner.max_iterations,
            output_log: self.layout.finetune_log(iteration),
        };
        self.invoke(&params.invocation(iteration, &self.config.finetuner)).await
    }

    /// Call the external phase and check its exit status and artifact.
    async fn invoke(&self, invocation: &PhaseInvocation) -> Result<()> {
        let phase = invocation.phase;
        let iteration = invocation.iteration;

        if let Some(artifact) = &invocation.expected_artifact {
            remove_stale(artifact)?;
        }

        let outcome = self
            .executor
            .execute(invocation)
            .await
            .map_err(|e| match e {
                ExecError::EmptyCommand => DriverError::EmptyCommand { phase },
                ExecError::Spawn(source) => DriverError::Spawn {
                    phase,
                    iteration,
                    source,
                },
                ExecError::Timeout { timeout_secs } => DriverError::Timeout {
                    phase,
                    iteration,
                    timeout_secs,
                },
                ExecError::Wait(source) => DriverError::Io(source),
            })?;

        debug!(
            phase = %phase,
            iteration,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "phase process exited"
        );

        if !outcome.passed() {
            return Err(DriverError::NonZeroExit {
                phase,
                iteration,
                exit_code: outcome.exit_code,
                stderr_tail: outcome.stderr_tail(),
            });
        }

        if let Some(artifact) = &invocation.expected_artifact {
            if !artifact.is_file() {
                return Err(DriverError::ArtifactMissing {
                    phase,
                    iteration,
                    path: artifact.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Drop an artifact left by an earlier attempt so it cannot pass for new output.
fn remove_stale(artifact: &Path) -> Result<()> {
    match fs::remove_file(artifact) {
        Ok(()) => {
            debug!(path = %artifact.display(), "removed stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
