//! Run configuration.
//!
//! A [`RunConfig`] is built once at startup, from a TOML file or the
//! built-in defaults, validated, and then passed by reference to every
//! component. Nothing mutates it mid-run.
//!
//! ```toml
//! [schedule]
//! kind = "exponential"
//! original_latency = 238.0
//! final_latency = 80.0
//! total_iterations = 5
//! cooling_coefficient = 0.5
//!
//! [optimizer]
//! command = ["matlab", "-batch", "bayesian_optimization"]
//! iterations = 100
//! init_samples = 20
//! mode = "unconstrained"
//! kappa = 10.0
//!
//! [selection]
//! no_feasible = "fastest"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FinepruneError, Result};
use crate::layout::OutputLayout;
use crate::schedule::RelaxationSchedule;

/// File name looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "fineprune.toml";

/// Complete, immutable configuration of one fine-pruning run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub schedule: RelaxationSchedule,
    pub optimizer: OptimizerConfig,
    pub pruner: PrunerConfig,
    pub finetuner: FinetunerConfig,
    pub paths: PathsConfig,
    pub selection: SelectionConfig,
}

/// How the optimizer treats the latency constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerMode {
    /// Search only configurations below the current threshold.
    #[default]
    Constrained,
    /// Maximize accuracy minus a latency penalty weighted by a per-iteration
    /// tradeoff factor.
    Unconstrained,
}

/// External Bayesian-optimization phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Command prefix; positional phase arguments are appended.
    pub command: Vec<String>,
    /// Optimization iterations after the initial samples.
    pub iterations: u32,
    /// Random initial samples.
    pub init_samples: u32,
    /// Bounded wait in seconds (0 = unbounded).
    pub timeout_secs: u64,
    pub mode: OptimizerMode,
    /// Exploration weight of the upper-confidence-bound acquisition.
    /// Unconstrained mode only.
    pub kappa: f64,
    /// Accuracy the unconstrained tradeoff is measured from: the accuracy
    /// allowed to drop towards `finetuner.min_accuracy` per step of the
    /// constraint.
    pub reference_accuracy: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "python".to_string(),
                "pruning/bayesian_optimization.py".to_string(),
            ],
            iterations: 100,
            init_samples: 20,
            timeout_secs: 0,
            mode: OptimizerMode::Constrained,
            kappa: 10.0,
            reference_accuracy: 0.57,
        }
    }
}

/// External pruning phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrunerConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "pruning/prune.py".to_string()],
            timeout_secs: 3600,
        }
    }
}

/// External fine-tuning phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinetunerConfig {
    pub command: Vec<String>,
    /// Training stops once validation accuracy reaches this floor...
    pub min_accuracy: f64,
    /// ...or after this many training steps.
    pub max_iterations: u64,
    pub timeout_secs: u64,
}

impl Default for FinetunerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "pruning/fine_tune.py".to_string()],
            min_accuracy: 0.55,
            max_iterations: 20_000,
            timeout_secs: 0,
        }
    }
}

/// Model inputs and the results root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Trained model the first iteration starts from.
    pub original_model: PathBuf,
    /// Network architecture definition handed to the pruner.
    pub architecture_spec: PathBuf,
    /// Training configuration handed to the fine-tuner.
    pub training_config: PathBuf,
    /// Parent of every run's output directory.
    pub results_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            original_model: PathBuf::from(
                "models/bvlc_reference_caffenet/bvlc_reference_caffenet.caffemodel",
            ),
            architecture_spec: PathBuf::from("models/bvlc_reference_caffenet/train_val.prototxt"),
            training_config: PathBuf::from(
                "models/bvlc_reference_caffenet/finetune_solver.prototxt",
            ),
            results_root: PathBuf::from("results"),
        }
    }
}

/// What to do when no candidate of an iteration meets its latency constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoFeasiblePolicy {
    /// Record the failure and stop the run.
    #[default]
    Abort,
    /// Continue with the lowest-latency candidate.
    Fastest,
}

/// Candidate selection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    pub no_feasible: NoFeasiblePolicy,
}

impl RunConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FinepruneError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from an explicit path, or from [`DEFAULT_CONFIG_FILE`] when it exists,
    /// or fall back to the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reject configurations that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;

        for (phase, command) in [
            ("optimizer", &self.optimizer.command),
            ("pruner", &self.pruner.command),
            ("finetuner", &self.finetuner.command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(FinepruneError::Configuration(format!(
                    "{phase} command must not be empty"
                )));
            }
        }

        if self.optimizer.iterations == 0 {
            return Err(FinepruneError::Configuration(
                "optimizer iterations must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.finetuner.min_accuracy) {
            return Err(FinepruneError::Configuration(format!(
                "min_accuracy must be within [0, 1], got {}",
                self.finetuner.min_accuracy
            )));
        }
        if self.finetuner.max_iterations == 0 {
            return Err(FinepruneError::Configuration(
                "max_iterations must be greater than zero".to_string(),
            ));
        }

        if self.optimizer.mode == OptimizerMode::Unconstrained {
            if !self.optimizer.kappa.is_finite() || self.optimizer.kappa < 0.0 {
                return Err(FinepruneError::Configuration(format!(
                    "kappa must be a non-negative number, got {}",
                    self.optimizer.kappa
                )));
            }
            if !(0.0..=1.0).contains(&self.optimizer.reference_accuracy) {
                return Err(FinepruneError::Configuration(format!(
                    "reference_accuracy must be within [0, 1], got {}",
                    self.optimizer.reference_accuracy
                )));
            }
            for iteration in 0..self.schedule.total_iterations {
                self.latency_tradeoff(iteration)?;
            }
        }
        Ok(())
    }

    /// Accuracy points the unconstrained optimizer may trade per millisecond
    /// of latency in `iteration`.
    ///
    /// `(reference_accuracy - min_accuracy) * 100 / (previous - current)`,
    /// where `previous` and `current` are the thresholds before and in
    /// `iteration`. Fails when the constraint does not tighten.
    pub fn latency_tradeoff(&self, iteration: u32) -> Result<f64> {
        let previous = self.schedule.previous_threshold(iteration)?;
        let current = self.schedule.threshold(iteration)?;
        let step = previous - current;
        let accuracy_budget = self.optimizer.reference_accuracy - self.finetuner.min_accuracy;
        let tradeoff = accuracy_budget * 100.0 / step;
        if step <= 0.0 || !tradeoff.is_finite() {
            return Err(FinepruneError::FlatConstraintStep {
                iteration,
                previous,
                current,
            });
        }
        Ok(tradeoff)
    }

    /// Hyperparameter signature naming the run's output directory.
    pub fn signature(&self) -> String {
        format!(
            "C_{}_cfp_{}_bo_{}_exp_{}_R_{}",
            self.schedule.final_latency,
            self.schedule.total_iterations,
            self.optimizer.iterations,
            self.schedule.cooling_coefficient,
            self.schedule.kind,
        )
    }

    /// SHA-256 over the canonical JSON form; recorded when a run starts.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Artifact layout of this run.
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(
            self.paths.results_root.join(self.signature()),
            &self.paths.original_model,
        )
    }

    /// Model an iteration starts from: the original model for iteration 0,
    /// otherwise the previous iteration's fine-tuned model.
    pub fn input_model(&self, iteration: u32) -> PathBuf {
        if iteration == 0 {
            self.paths.original_model.clone()
        } else {
            self.layout().finetuned_model(iteration - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKind;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = RunConfig::default();
        assert_eq!(config.schedule.original_latency, 238.0);
        assert_eq!(config.schedule.final_latency, 80.0);
        assert_eq!(config.schedule.total_iterations, 5);
        assert_eq!(config.optimizer.iterations, 100);
        assert_eq!(config.optimizer.init_samples, 20);
        assert_eq!(config.finetuner.min_accuracy, 0.55);
        assert_eq!(config.finetuner.max_iterations, 20_000);
        assert_eq!(config.selection.no_feasible, NoFeasiblePolicy::Abort);
        assert_eq!(config.optimizer.mode, OptimizerMode::Constrained);
        assert_eq!(config.optimizer.kappa, 10.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_signature() {
        let config = RunConfig::default();
        assert_eq!(config.signature(), "C_80_cfp_5_bo_100_exp_0.5_R_linear");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            [schedule]
            kind = "one-step"
            original_latency = 200.0
            final_latency = 120.0
            total_iterations = 3

            [selection]
            no_feasible = "fastest"
            "#,
        )
        .unwrap();
        assert_eq!(config.schedule.kind, ScheduleKind::OneStep);
        assert_eq!(config.schedule.cooling_coefficient, 0.5);
        assert_eq!(config.optimizer.iterations, 100);
        assert_eq!(config.selection.no_feasible, NoFeasiblePolicy::Fastest);
    }

    #[test]
    fn test_unknown_schedule_kind_rejected() {
        let err = RunConfig::from_toml_str(
            r#"
            [schedule]
            kind = "sigmoid"
            original_latency = 200.0
            final_latency = 120.0
            total_iterations = 3
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sigmoid"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = RunConfig::from_toml_str("[optimizer]\nacquisition = \"ei\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unconstrained_mode_from_toml() {
        let config = RunConfig::from_toml_str(
            r#"
            [optimizer]
            mode = "unconstrained"
            kappa = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.optimizer.mode, OptimizerMode::Unconstrained);
        assert_eq!(config.optimizer.kappa, 5.0);
        assert_eq!(config.optimizer.reference_accuracy, 0.57);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_latency_tradeoff_per_iteration() {
        // Linear 238 -> 80 over 5 iterations tightens by 31.6 ms every step.
        let config = RunConfig::default();
        for iteration in 0..5 {
            let tradeoff = config.latency_tradeoff(iteration).unwrap();
            assert!((tradeoff - 2.0 / 31.6).abs() < 1e-9, "iteration {iteration}: {tradeoff}");
        }

        let mut config = RunConfig::default();
        config.schedule.kind = ScheduleKind::Exponential;
        let first = config.latency_tradeoff(0).unwrap();
        let second = config.latency_tradeoff(1).unwrap();
        assert!((first - 2.0 / (238.0 - 167.965_487)).abs() < 1e-6);
        assert!(second > first);
    }

    #[test]
    fn test_latency_tradeoff_rejects_flat_step() {
        let mut config = RunConfig::default();
        config.schedule.kind = ScheduleKind::OneStep;
        assert!(config.latency_tradeoff(0).is_ok());
        let err = config.latency_tradeoff(1).unwrap_err();
        assert!(matches!(err, FinepruneError::FlatConstraintStep { iteration: 1, .. }));

        // Constrained mode never needs the tradeoff.
        assert!(config.validate().is_ok());
        config.optimizer.mode = OptimizerMode::Unconstrained;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_kappa() {
        let mut config = RunConfig::default();
        config.optimizer.mode = OptimizerMode::Unconstrained;
        config.optimizer.kappa = -1.0;
        assert!(config.validate().unwrap_err().to_string().contains("kappa"));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = RunConfig::default();
        config.pruner.command.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pruner"));
    }

    #[test]
    fn test_validate_rejects_min_accuracy_out_of_range() {
        let mut config = RunConfig::default();
        config.finetuner.min_accuracy = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = RunConfig::default();
        let mut b = RunConfig::default();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        b.finetuner.min_accuracy = 0.5;
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }

    #[test]
    fn test_input_model_chain() {
        let config = RunConfig::default();
        assert_eq!(config.input_model(0), config.paths.original_model);
        let second = config.input_model(2);
        assert!(second.ends_with("1th_finetuned.caffemodel"));
        assert!(second.starts_with("results/C_80_cfp_5_bo_100_exp_0.5_R_linear"));
    }
}
