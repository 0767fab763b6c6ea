//! fineprune core
//!
//! Bookkeeping for latency-constrained iterative fine-pruning:
//! - relaxation schedules mapping iterations to latency thresholds
//! - the append-only run log and its typed markers
//! - resume-point resolution after an interruption
//! - optimizer result records and best-candidate selection
//! - the immutable run configuration and output layout

pub mod config;
pub mod error;
pub mod layout;
pub mod obs;
pub mod phase;
pub mod records;
pub mod resolver;
pub mod run_log;
pub mod schedule;
pub mod telemetry;

pub use config::{
    FinetunerConfig, NoFeasiblePolicy, OptimizerConfig, OptimizerMode, PathsConfig, PrunerConfig,
    RunConfig, SelectionConfig, DEFAULT_CONFIG_FILE,
};
pub use error::{FinepruneError, Result};
pub use layout::OutputLayout;
pub use obs::run_span;
pub use phase::{Phase, ResumePoint};
pub use records::{load as load_records, select_best, select_fastest, ResultRecord};
pub use resolver::{resolve, resolve_file, RecordedFailure, Resolution};
pub use run_log::{Level, LogEntry, LogScan, RunEvent, RunLog};
pub use schedule::{RelaxationSchedule, ScheduleKind};
pub use telemetry::init_tracing;

/// fineprune version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
