//! Errors raised while driving iterations.

use std::path::PathBuf;

use fineprune_core::{FinepruneError, Phase};

/// Why a phase (and with it the current iteration) failed.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Core(#[from] FinepruneError),

    #[error("{phase} command is empty")]
    EmptyCommand { phase: Phase },

    #[error("{phase} of iteration {iteration} could not be started: {source}")]
    Spawn {
        phase: Phase,
        iteration: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase} of iteration {iteration} timed out after {timeout_secs}s and was killed")]
    Timeout {
        phase: Phase,
        iteration: u32,
        timeout_secs: u64,
    },

    #[error("{phase} of iteration {iteration} exited with code {exit_code}: {stderr_tail}")]
    NonZeroExit {
        phase: Phase,
        iteration: u32,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("{phase} of iteration {iteration} did not produce {}", .path.display())]
    ArtifactMissing {
        phase: Phase,
        iteration: u32,
        path: PathBuf,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Whether the error invalidates only the current iteration (and is
    /// recorded as a phase failure) rather than the whole invocation.
    pub fn is_iteration_failure(&self) -> bool {
        !matches!(
            self,
            DriverError::Core(FinepruneError::Configuration(_))
                | DriverError::Core(FinepruneError::ResumeAmbiguity { .. })
        )
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
