//! Artifact layout of a run's output directory.
//!
//! ```text
//! <results_root>/<signature>/
//!   fine_pruning.log          run log
//!   <t>bo.log                 optimizer results of iteration t
//!   pruning_dict.json         pruning configuration hand-off
//!   best_sampled.<ext>        pruned model, overwritten each iteration
//!   <t>th_finetuned.<ext>     fine-tuned model of iteration t
//!   <t>th_finetuned.log       fine-tuning log of iteration t
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FinepruneError, Result};

const RUN_LOG_FILE: &str = "fine_pruning.log";
const PRUNING_CONFIG_FILE: &str = "pruning_dict.json";
const DEFAULT_MODEL_EXTENSION: &str = "model";

/// Paths of every artifact a run reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    dir: PathBuf,
    model_extension: String,
}

impl OutputLayout {
    /// Layout rooted at `dir`; model artifacts reuse the extension of `original_model`.
    pub fn new(dir: impl Into<PathBuf>, original_model: &Path) -> Self {
        let model_extension = original_model
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or(DEFAULT_MODEL_EXTENSION)
            .to_string();
        Self {
            dir: dir.into(),
            model_extension,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_log(&self) -> PathBuf {
        self.dir.join(RUN_LOG_FILE)
    }

    /// Prefix handed to the optimizer; it writes `<prefix>bo.log`.
    pub fn optimizer_prefix(&self, iteration: u32) -> PathBuf {
        self.dir.join(iteration.to_string())
    }

    pub fn result_log(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("{iteration}bo.log"))
    }

    pub fn pruning_config(&self) -> PathBuf {
        self.dir.join(PRUNING_CONFIG_FILE)
    }

    pub fn best_sampled_model(&self) -> PathBuf {
        self.dir.join(format!("best_sampled.{}", self.model_extension))
    }

    pub fn finetuned_model(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("{iteration}th_finetuned.{}", self.model_extension))
    }

    pub fn finetune_log(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("{iteration}th_finetuned.log"))
    }

    /// Create the output directory for a fresh run.
    ///
    /// Fails if it already exists so an earlier run is never overwritten.
    pub fn create_fresh(&self) -> Result<()> {
        if self.dir.exists() {
            return Err(FinepruneError::Configuration(format!(
                "{} already exists; pass `resume` to continue that run",
                self.dir.display()
            )));
        }
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir(&self.dir)?;
        Ok(())
    }

    /// Check that a resumable run exists here.
    pub fn ensure_resumable(&self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(FinepruneError::Configuration(format!(
                "cannot resume: output directory {} does not exist",
                self.dir.display()
            )));
        }
        if !self.run_log().is_file() {
            return Err(FinepruneError::Configuration(format!(
                "cannot resume: run log {} does not exist",
                self.run_log().display()
            )));
        }
        Ok(())
    }
}
