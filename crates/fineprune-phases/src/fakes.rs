//! Scripted phase executor (testing only)
//!
//! `ScriptedExecutor` honours the external-phase contracts without running
//! any process: the optimizer writes a result log next to its output prefix,
//! and the pruner and fine-tuner write their output model. Failures can be
//! injected per `(phase, iteration)` and fire once.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fineprune_core::{Phase, ResultRecord};

use crate::invocation::PhaseInvocation;
use crate::runner::{ExecError, PhaseExecutor, PhaseOutcome};

/// A failure injected into one scripted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Exit with this code after writing nothing.
    ExitCode(i32),
    /// Exit 0 without writing the expected artifact.
    NoArtifact,
    /// Behave as if the bounded wait elapsed.
    Timeout,
}

/// Phase executor that fakes the external tools on the local filesystem.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<PhaseInvocation>>,
    failures: Mutex<HashMap<(Phase, u32), ScriptedFailure>>,
    records: Mutex<HashMap<u32, Vec<ResultRecord>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `phase` in `iteration` fail.
    pub fn fail_once(self, phase: Phase, iteration: u32, failure: ScriptedFailure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((phase, iteration), failure);
        self
    }

    /// Replace the optimizer output of `iteration`.
    pub fn with_records(self, iteration: u32, records: Vec<ResultRecord>) -> Self {
        self.records.lock().unwrap().insert(iteration, records);
        self
    }

    /// Every invocation seen so far, in call order.
    pub fn calls(&self) -> Vec<PhaseInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// `(phase, iteration)` of every call, in order.
    pub fn call_names(&self) -> Vec<String> {
        self.calls().iter().map(PhaseInvocation::name).collect()
    }

    /// Candidates straddling `constraint`: a fast inaccurate one, a feasible
    /// winner and an infeasible accurate one.
    pub fn default_records(constraint: f64) -> Vec<ResultRecord> {
        vec![
            record(&[("conv1", 0.2), ("fc6", 0.5)], constraint + 10.0, 0.58),
            record(&[("conv1", 0.3), ("fc6", 0.6)], constraint - 5.0, 0.56),
            record(&[("conv1", 0.5), ("fc6", 0.9)], constraint - 20.0, 0.50),
        ]
    }

    fn optimize(&self, invocation: &PhaseInvocation) -> std::io::Result<()> {
        let constraint: f64 = invocation.args[4].parse().unwrap_or(0.0);
        let prefix = &invocation.args[5];
        let records = self
            .records
            .lock()
            .unwrap()
            .get(&invocation.iteration)
            .cloned()
            .unwrap_or_else(|| Self::default_records(constraint));

        let mut text = String::new();
        for record in &records {
            text.push_str(&serde_json::to_string(record).unwrap());
            text.push('\n');
        }
        fs::write(format!("{prefix}bo.log"), text)
    }

    fn write_model(invocation: &PhaseInvocation) -> std::io::Result<()> {
        let output = Path::new(&invocation.args[2]);
        fs::write(
            output,
            format!("{} from {}\n", invocation.name(), invocation.args[0]),
        )
    }
}

fn record(ratios: &[(&str, f64)], latency: f64, accuracy: f64) -> ResultRecord {
    ResultRecord {
        pruning_config: ratios
            .iter()
            .map(|(layer, ratio)| (layer.to_string(), *ratio))
            .collect(),
        latency,
        accuracy,
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &PhaseInvocation) -> Result<PhaseOutcome, ExecError> {
        self.calls.lock().unwrap().push(invocation.clone());

        if invocation.program.is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .remove(&(invocation.phase, invocation.iteration));

        let mut outcome = PhaseOutcome {
            name: invocation.name(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            success: true,
        };

        match failure {
            Some(ScriptedFailure::Timeout) => {
                return Err(ExecError::Timeout {
                    timeout_secs: invocation.timeout_secs,
                })
            }
            Some(ScriptedFailure::ExitCode(code)) => {
                outcome.exit_code = code;
                outcome.success = false;
                outcome.stderr = format!("scripted failure of {}\n", invocation.name());
                return Ok(outcome);
            }
            Some(ScriptedFailure::NoArtifact) => return Ok(outcome),
            None => {}
        }

        let written = match invocation.phase {
            Phase::Optimization => self.optimize(invocation),
            Phase::Pruning | Phase::FineTuning => Self::write_model(invocation),
        };
        written.map_err(ExecError::Wait)?;
        Ok(outcome)
    }
}

/// Path the optimizer of `invocation` writes its records to.
pub fn result_log_of(invocation: &PhaseInvocation) -> PathBuf {
    PathBuf::from(format!("{}bo.log", invocation.args[5]))
}
