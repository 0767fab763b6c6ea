//! fineprune phases
//!
//! Runs the external optimizer, pruner and fine-tuner as child processes and
//! drives them through a resumable sequence of fine-pruning iterations.

pub mod driver;
pub mod error;
pub mod fakes;
pub mod handoff;
pub mod invocation;
pub mod runner;

pub use driver::{DriveReport, IterationDriver, PhaseTiming};
pub use error::{DriverError, Result};
pub use handoff::{read_pruning_config, write_pruning_config};
pub use invocation::{
    FinetuneParams, OptimizeParams, PhaseInvocation, PruneParams, UnconstrainedOptimizeParams,
};
pub use runner::{ExecError, PhaseExecutor, PhaseOutcome, ProcessExecutor};
