//! Structured tracing hooks for the fine-pruning lifecycle.
//!
//! - [`run_span`] tags everything emitted during a session with its id
//! - `emit_*` functions log lifecycle events with stable field names
//!
//! These mirror what is written to the run log, for operators watching stderr.

use tracing::{error, info, warn};

use crate::phase::{Phase, ResumePoint};

/// Session-scoped span; attach it to the driver future with `Instrument`.
///
/// ```ignore
/// driver.run(point).instrument(run_span(&session_id, &signature)).await
/// ```
pub fn run_span(session_id: &str, signature: &str) -> tracing::Span {
    tracing::info_span!("fineprune.run", session_id = %session_id, signature = %signature)
}

pub fn emit_run_started(signature: &str, total_iterations: u32) {
    info!(event = "run.started", signature = %signature, total_iterations);
}

pub fn emit_run_resumed(point: &ResumePoint) {
    info!(
        event = "run.resumed",
        iteration = point.iteration,
        next_phase = %point.entry_phase(),
    );
}

pub fn emit_iteration_started(iteration: u32, constraint: f64) {
    info!(event = "iteration.started", iteration, constraint);
}

pub fn emit_phase_started(iteration: u32, phase: Phase) {
    info!(event = "phase.started", iteration, phase = %phase);
}

pub fn emit_phase_completed(iteration: u32, phase: Phase, duration_ms: u64) {
    info!(event = "phase.completed", iteration, phase = %phase, duration_ms);
}

/// Phase failure (error level).
pub fn emit_phase_failed(iteration: u32, phase: Phase, reason: &dyn std::fmt::Display) {
    error!(event = "phase.failed", iteration, phase = %phase, reason = %reason);
}

pub fn emit_candidate_selected(iteration: u32, latency: f64, accuracy: f64, feasible: bool) {
    if feasible {
        info!(event = "candidate.selected", iteration, latency, accuracy);
    } else {
        warn!(
            event = "candidate.fallback",
            iteration, latency, accuracy, "no feasible candidate; using the fastest one"
        );
    }
}

pub fn emit_run_finished(iterations: u32, duration_ms: u64) {
    info!(event = "run.finished", iterations, duration_ms);
}
