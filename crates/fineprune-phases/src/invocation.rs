//! External phase invocations.
//!
//! Each phase receives an explicit, immutable parameter record which is
//! rendered to positional arguments appended to the configured command.

use std::path::{Path, PathBuf};

use fineprune_core::{FinetunerConfig, OptimizerConfig, Phase, PrunerConfig};
use serde::{Deserialize, Serialize};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A fully specified external phase call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInvocation {
    /// Phase this call implements.
    pub phase: Phase,

    /// Iteration the call belongs to.
    pub iteration: u32,

    /// Command prefix (first element is the executable).
    pub program: Vec<String>,

    /// Positional phase arguments appended to `program`.
    pub args: Vec<String>,

    /// Bounded wait in seconds (0 = unbounded).
    pub timeout_secs: u64,

    /// File the call must leave behind to count as successful.
    pub expected_artifact: Option<PathBuf>,
}

impl PhaseInvocation {
    /// Human-readable name, e.g. `pruning#3`.
    pub fn name(&self) -> String {
        format!("{}#{}", self.phase, self.iteration)
    }

    /// Full command line: program prefix followed by the phase arguments.
    pub fn command(&self) -> Vec<String> {
        self.program.iter().chain(self.args.iter()).cloned().collect()
    }
}

/// Parameters of the Bayesian-optimization phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeParams {
    pub iterations: u32,
    pub init_samples: u32,
    pub input_model: PathBuf,
    pub previous_constraint: f64,
    pub current_constraint: f64,
    /// The optimizer writes its results to `<output_prefix>bo.log`.
    pub output_prefix: PathBuf,
    pub original_latency: f64,
}

impl OptimizeParams {
    pub fn args(&self) -> Vec<String> {
        vec![
            self.iterations.to_string(),
            self.init_samples.to_string(),
            path_arg(&self.input_model),
            self.previous_constraint.to_string(),
            self.current_constraint.to_string(),
            path_arg(&self.output_prefix),
            self.original_latency.to_string(),
        ]
    }

    pub fn invocation(
        &self,
        iteration: u32,
        config: &OptimizerConfig,
        result_log: PathBuf,
    ) -> PhaseInvocation {
        PhaseInvocation {
            phase: Phase::Optimization,
            iteration,
            program: config.command.clone(),
            args: self.args(),
            timeout_secs: config.timeout_secs,
            expected_artifact: Some(result_log),
        }
    }
}

/// Parameters of the Bayesian-optimization phase in unconstrained mode.
///
/// Renders the constrained arguments followed by the latency tradeoff
/// factor and `kappa`; the two trailing arguments select the mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnconstrainedOptimizeParams {
    pub search: OptimizeParams,
    pub latency_tradeoff: f64,
    pub kappa: f64,
}

impl UnconstrainedOptimizeParams {
    pub fn args(&self) -> Vec<String> {
        let mut args = self.search.args();
        args.push(self.latency_tradeoff.to_string());
        args.push(self.kappa.to_string());
        args
    }

    pub fn invocation(
        &self,
        iteration: u32,
        config: &OptimizerConfig,
        result_log: PathBuf,
    ) -> PhaseInvocation {
        PhaseInvocation {
            args: self.args(),
            ..self.search.invocation(iteration, config, result_log)
        }
    }
}

/// Parameters of the pruning phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneParams {
    pub input_model: PathBuf,
    pub architecture_spec: PathBuf,
    pub output_model: PathBuf,
    pub pruning_config_file: PathBuf,
}

impl PruneParams {
    pub fn args(&self) -> Vec<String> {
        vec![
            path_arg(&self.input_model),
            path_arg(&self.architecture_spec),
            path_arg(&self.output_model),
            path_arg(&self.pruning_config_file),
        ]
    }

    pub fn invocation(&self, iteration: u32, config: &PrunerConfig) -> PhaseInvocation {
        PhaseInvocation {
            phase: Phase::Pruning,
            iteration,
            program: config.command.clone(),
            args: self.args(),
            timeout_secs: config.timeout_secs,
            expected_artifact: Some(self.output_model.clone()),
        }
    }
}

/// Parameters of the fine-tuning phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneParams {
    pub input_model: PathBuf,
    pub training_config: PathBuf,
    pub output_model: PathBuf,
    pub min_accuracy: f64,
    pub max_training_steps: u64,
    pub output_log: PathBuf,
}

impl FinetuneParams {
    pub fn args(&self) -> Vec<String> {
        vec![
            path_arg(&self.input_model),
            path_arg(&self.training_config),
            path_arg(&self.output_model),
            self.min_accuracy.to_string(),
            self.max_training_steps.to_string(),
            path_arg(&self.output_log),
        ]
    }

    pub fn invocation(&self, iteration: u32, config: &FinetunerConfig) -> PhaseInvocation {
        PhaseInvocation {
            phase: Phase::FineTuning,
            iteration,
            program: config.command.clone(),
            args: self.args(),
            timeout_secs: config.timeout_secs,
            expected_artifact: Some(self.output_model.clone()),
        }
    }
}
