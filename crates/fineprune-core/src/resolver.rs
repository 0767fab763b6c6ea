//! Resume-point resolution from the run log.
//!
//! The resolver walks the log's entries in order and tracks the latest phase
//! whose *completion* was recorded. The next phase to run is the one after
//! it; a completed fine-tuning moves on to the following iteration. Started
//! and failed markers are reported but never count as completion, so a phase
//! interrupted or failed mid-way is simply re-run.
//!
//! Logs written by the older text-only driver are understood too: its
//! "... in {t}th iteration takes ..." timing lines mark phase completion.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{FinepruneError, Result};
use crate::phase::{Phase, ResumePoint};
use crate::run_log::{LogEntry, LogScan, RunEvent};

/// A phase failure found in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFailure {
    pub iteration: u32,
    pub phase: Phase,
    pub reason: String,
}

/// Everything the log says about where the run stands.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Where the run continues.
    pub point: ResumePoint,
    /// Last completed `(iteration, phase)`, if any.
    pub last_completed: Option<(u32, Phase)>,
    /// A phase that was started after the last completion but never finished.
    pub interrupted: Option<(u32, Phase)>,
    /// The most recent failure at or after the resume point.
    pub last_failure: Option<RecordedFailure>,
    /// Config digest recorded when the run started.
    pub config_digest: Option<String>,
    /// Whether a `run_completed` marker was seen.
    pub run_completed: bool,
    /// Phase markers taken as evidence.
    pub markers: usize,
    /// Completion markers ignored because they would move the resume point backwards.
    pub regressions: usize,
    /// Completion markers ignored because their iteration has no successor.
    pub out_of_range: usize,
}

impl Resolution {
    fn fresh() -> Self {
        Self {
            point: ResumePoint::fresh(),
            last_completed: None,
            interrupted: None,
            last_failure: None,
            config_digest: None,
            run_completed: false,
            markers: 0,
            regressions: 0,
            out_of_range: 0,
        }
    }
}

/// Phase marker extracted from one entry.
#[derive(Debug, Clone, PartialEq)]
enum Marker {
    Started(u32, Phase),
    Completed(u32, Phase),
    Failed(RecordedFailure),
    RunStarted { config_digest: String },
    RunCompleted,
}

fn legacy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:(Bayesian optimization|Pruning the best sampled model|Fine-tuning) in (\d+)th iteration takes|Start (\d+)th fine-pruning iteration)",
        )
        .expect("legacy marker pattern is valid")
    })
}

fn legacy_marker(message: &str) -> Option<Marker> {
    let caps = legacy_pattern().captures(message.trim())?;
    if let Some(started) = caps.get(3) {
        let iteration = started.as_str().parse().ok()?;
        return Some(Marker::Started(iteration, Phase::Optimization));
    }
    let phase = match caps.get(1)?.as_str() {
        "Bayesian optimization" => Phase::Optimization,
        "Pruning the best sampled model" => Phase::Pruning,
        _ => Phase::FineTuning,
    };
    let iteration = caps.get(2)?.as_str().parse().ok()?;
    Some(Marker::Completed(iteration, phase))
}

fn marker(entry: &LogEntry) -> Option<Marker> {
    match entry.event() {
        Some(RunEvent::PhaseStarted { iteration, phase }) => Some(Marker::Started(iteration, phase)),
        Some(RunEvent::PhaseCompleted {
            iteration, phase, ..
        }) => Some(Marker::Completed(iteration, phase)),
        Some(RunEvent::PhaseFailed {
            iteration,
            phase,
            reason,
        }) => Some(Marker::Failed(RecordedFailure {
            iteration,
            phase,
            reason,
        })),
        Some(RunEvent::RunStarted { config_digest, .. }) => {
            Some(Marker::RunStarted { config_digest })
        }
        Some(RunEvent::RunCompleted { .. }) => Some(Marker::RunCompleted),
        Some(_) => None,
        None => legacy_marker(&entry.message),
    }
}

/// Resolve the resume point from an already scanned log.
///
/// `source` only names the log in errors. Fails with
/// [`FinepruneError::ResumeAmbiguity`] when the log holds complete lines but
/// none of them parse; every other shape degrades gracefully.
pub fn resolve(scan: &LogScan, source: &Path) -> Result<Resolution> {
    if scan.entries.is_empty() && scan.malformed_lines > 0 {
        return Err(FinepruneError::ResumeAmbiguity {
            path: source.to_path_buf(),
        });
    }
    if scan.truncated_tail {
        debug!(log = %source.display(), "ignoring unterminated trailing entry");
    }

    let mut resolution = Resolution::fresh();

    for entry in &scan.entries {
        let Some(marker) = marker(entry) else {
            continue;
        };
        match marker {
            Marker::RunStarted { config_digest } => {
                resolution.config_digest = Some(config_digest);
            }
            Marker::RunCompleted => {
                resolution.run_completed = true;
            }
            Marker::Started(iteration, phase) => {
                resolution.markers += 1;
                let point = ResumePoint {
                    iteration,
                    next_phase: Some(phase),
                };
                if !point.precedes(&resolution.point) {
                    resolution.interrupted = Some((iteration, phase));
                }
            }
            Marker::Completed(iteration, phase) => {
                let Some(point) = ResumePoint::after(iteration, phase) else {
                    warn!(
                        iteration,
                        phase = %phase,
                        "ignoring completion marker with an out-of-range iteration"
                    );
                    resolution.out_of_range += 1;
                    continue;
                };
                resolution.markers += 1;
                if point.precedes(&resolution.point) {
                    warn!(
                        iteration,
                        phase = %phase,
                        "ignoring completion marker behind the current resume point"
                    );
                    resolution.regressions += 1;
                    continue;
                }
                resolution.point = point;
                resolution.last_completed = Some((iteration, phase));
                resolution.interrupted = None;
                resolution.last_failure = None;
            }
            Marker::Failed(failure) => {
                resolution.markers += 1;
                resolution.last_failure = Some(failure);
            }
        }
    }

    Ok(resolution)
}

/// Read the log at `path` and resolve its resume point.
///
/// A missing or empty log resolves to a fresh start.
pub fn resolve_file(path: &Path) -> Result<Resolution> {
    let scan = LogScan::read(path)?;
    resolve(&scan, path)
}
