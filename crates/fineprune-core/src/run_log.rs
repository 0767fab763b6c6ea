//! Append-only run log.
//!
//! Every line has the form `<YYYY-mm-dd HH:MM:SS>, <LEVEL>: <message>`.
//! Machine-readable markers are messages holding one JSON object tagged by
//! `event`, for example:
//!
//! ```text
//! 2026-03-02 14:07:31, INFO: {"event":"phase_completed","iteration":2,"phase":"optimization","duration_ms":5123}
//! ```
//!
//! Free-text lines are allowed for operators and are not evidence for
//! resuming. The log is the only state persisted for crash recovery.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::phase::Phase;
use crate::schedule::ScheduleKind;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARNING" | "WARN" => Ok(Level::Warning),
            "ERROR" | "CRITICAL" => Ok(Level::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed marker written to the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A fresh run began.
    RunStarted {
        session_id: String,
        signature: String,
        config_digest: String,
        schedule: ScheduleKind,
        original_latency: f64,
        final_latency: f64,
        total_iterations: u32,
    },

    /// An interrupted run was picked up again.
    RunResumed {
        session_id: String,
        iteration: u32,
        next_phase: Option<Phase>,
    },

    /// An iteration entered optimization under `constraint`.
    IterationStarted { iteration: u32, constraint: f64 },

    PhaseStarted { iteration: u32, phase: Phase },

    PhaseCompleted {
        iteration: u32,
        phase: Phase,
        duration_ms: u64,
    },

    /// The candidate handed to the pruner.
    CandidateSelected {
        iteration: u32,
        latency: f64,
        accuracy: f64,
        /// `false` when chosen by the fastest-candidate fallback.
        feasible: bool,
        pruning_config: BTreeMap<String, f64>,
    },

    PhaseFailed {
        iteration: u32,
        phase: Phase,
        reason: String,
    },

    /// All iterations finished.
    RunCompleted { iterations: u32 },
}

impl RunEvent {
    /// Severity the event is logged at.
    pub fn level(&self) -> Level {
        match self {
            RunEvent::PhaseFailed { .. } => Level::Error,
            RunEvent::CandidateSelected { feasible: false, .. } => Level::Warning,
            _ => Level::Info,
        }
    }

    /// Snake_case tag of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::RunResumed { .. } => "run_resumed",
            RunEvent::IterationStarted { .. } => "iteration_started",
            RunEvent::PhaseStarted { .. } => "phase_started",
            RunEvent::PhaseCompleted { .. } => "phase_completed",
            RunEvent::CandidateSelected { .. } => "candidate_selected",
            RunEvent::PhaseFailed { .. } => "phase_failed",
            RunEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

/// One fully written line of the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub level: Level,
    pub message: String,
}

impl LogEntry {
    /// Parse `<timestamp>, <LEVEL>: <message>`. Returns `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\r');
        let (timestamp, rest) = line.split_once(", ")?;
        let (level, message) = rest.split_once(": ")?;
        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        let level = level.parse().ok()?;
        Some(Self {
            timestamp,
            level,
            message: message.to_string(),
        })
    }

    /// The typed marker carried by this entry, if any.
    pub fn event(&self) -> Option<RunEvent> {
        let message = self.message.trim();
        if !message.starts_with('{') {
            return None;
        }
        serde_json::from_str(message).ok()
    }

    /// Render as a single log line, without the trailing newline.
    pub fn render(&self) -> String {
        format!(
            "{}, {}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.level,
            self.message
        )
    }
}

/// Result of scanning a run log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogScan {
    /// Fully written, well-formed entries in file order.
    pub entries: Vec<LogEntry>,
    /// Complete lines that did not parse as entries.
    pub malformed_lines: usize,
    /// Whether the file ended in an unterminated partial line, which is ignored.
    pub truncated_tail: bool,
}

impl LogScan {
    /// Split `text` into entries; an unterminated last line is dropped.
    pub fn parse(text: &str) -> Self {
        let mut scan = LogScan::default();

        let complete = match text.rfind('\n') {
            Some(end) => {
                scan.truncated_tail = end + 1 < text.len();
                &text[..end]
            }
            None => {
                scan.truncated_tail = !text.is_empty();
                ""
            }
        };

        for line in complete.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            match LogEntry::parse(line) {
                Some(entry) => scan.entries.push(entry),
                None => scan.malformed_lines += 1,
            }
        }
        scan
    }

    /// Read and scan the log at `path`; a missing file scans as empty.
    pub fn read(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self::parse(&String::from_utf8_lossy(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Typed markers in file order.
    pub fn events(&self) -> impl Iterator<Item = RunEvent> + '_ {
        self.entries.iter().filter_map(LogEntry::event)
    }
}

/// Append-only writer for the run log.
///
/// Each entry is written as one complete line with a single `write_all`,
/// then flushed and synced.
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Open (or create) the log for appending.
    ///
    /// If a previous process died mid-write, the partial line is terminated
    /// first so the next entry starts on its own line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
            }
        }

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a free-text entry. Embedded newlines are flattened.
    pub fn append(&mut self, level: Level, message: &str) -> Result<()> {
        let entry = LogEntry {
            timestamp: Local::now().naive_local(),
            level,
            message: message.replace(['\r', '\n'], " "),
        };
        let mut line = entry.render();
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn info(&mut self, message: &str) -> Result<()> {
        self.append(Level::Info, message)
    }

    pub fn warn(&mut self, message: &str) -> Result<()> {
        self.append(Level::Warning, message)
    }

    pub fn error(&mut self, message: &str) -> Result<()> {
        self.append(Level::Error, message)
    }

    /// Append a typed marker at its own level.
    pub fn record(&mut self, event: &RunEvent) -> Result<()> {
        let message = serde_json::to_string(event)?;
        self.append(event.level(), &message)
    }
}
