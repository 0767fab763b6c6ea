//! External phase execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::invocation::PhaseInvocation;

/// Result of one external phase call.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    /// Invocation name, e.g. `pruning#3`.
    pub name: String,

    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the process reported success.
    pub success: bool,
}

impl PhaseOutcome {
    /// Whether this call passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

/// Why an external call produced no outcome at all.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("failed while waiting: {0}")]
    Wait(#[source] std::io::Error),
}

/// Runs external phases. The driver only talks to this seam.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Run `invocation` to completion and report its outcome.
    async fn execute(&self, invocation: &PhaseInvocation) -> Result<PhaseOutcome, ExecError>;
}

/// Executes phases as child processes.
///
/// The child is killed if its bounded wait elapses.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    working_dir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every phase from `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl PhaseExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &PhaseInvocation) -> Result<PhaseOutcome, ExecError> {
        let start = Instant::now();

        let command = invocation.command();
        let (exe, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(phase = %invocation.name(), command = ?command, "spawning phase");
        let child = cmd.spawn().map_err(ExecError::Spawn)?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = if invocation.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(invocation.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ExecError::Timeout {
                timeout_secs: invocation.timeout_secs,
            })?
            .map_err(ExecError::Wait)?
        } else {
            child.wait_with_output().await.map_err(ExecError::Wait)?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(PhaseOutcome {
            name: invocation.name(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
