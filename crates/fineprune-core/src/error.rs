//! Error taxonomy for fineprune core operations.

use std::path::PathBuf;

/// Errors produced by configuration, schedule, run log and result record handling.
#[derive(Debug, thiserror::Error)]
pub enum FinepruneError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported relaxation schedule kind: {kind}")]
    UnsupportedScheduleKind { kind: String },

    #[error("iteration {iteration} out of range for a schedule of {total} iterations")]
    IterationOutOfRange { iteration: u32, total: u32 },

    #[error("run log {path} is not empty but contains no parseable entries")]
    ResumeAmbiguity { path: PathBuf },

    #[error("result log not found: {0}")]
    ResultLogMissing(PathBuf),

    #[error("no candidate meets latency constraint {constraint:.2} ms in iteration {iteration}")]
    NoFeasibleCandidate { iteration: u32, constraint: f64 },

    #[error("latency constraint does not tighten in iteration {iteration} ({previous:.2} -> {current:.2} ms)")]
    FlatConstraintStep {
        iteration: u32,
        previous: f64,
        current: f64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fineprune core operations.
pub type Result<T> = std::result::Result<T, FinepruneError>;
