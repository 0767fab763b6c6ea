//! Iteration phases and resume points.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three phases every fine-pruning iteration runs through, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Bayesian-optimization search for per-layer pruning ratios.
    Optimization,

    /// Applying the selected pruning ratios to the input model.
    Pruning,

    /// Retraining the pruned model to recover accuracy.
    FineTuning,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Optimization, Phase::Pruning, Phase::FineTuning];

    /// Stable snake_case name, as written to the run log.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Optimization => "optimization",
            Phase::Pruning => "pruning",
            Phase::FineTuning => "fine_tuning",
        }
    }

    /// The phase that follows this one within the same iteration.
    ///
    /// `None` after fine-tuning: the iteration is finished.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Optimization => Some(Phase::Pruning),
            Phase::Pruning => Some(Phase::FineTuning),
            Phase::FineTuning => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a run continues: an iteration index plus the next phase to execute.
///
/// `next_phase == None` means "start the iteration from the top".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumePoint {
    pub iteration: u32,
    pub next_phase: Option<Phase>,
}

impl ResumePoint {
    /// The resume point of a run that has not done any work yet.
    pub fn fresh() -> Self {
        Self {
            iteration: 0,
            next_phase: None,
        }
    }

    /// Resume point implied by `phase` of `iteration` having completed.
    ///
    /// `None` when fine-tuning of the last representable iteration completed.
    pub fn after(iteration: u32, phase: Phase) -> Option<Self> {
        match phase.next() {
            Some(next) => Some(Self {
                iteration,
                next_phase: Some(next),
            }),
            None => Some(Self {
                iteration: iteration.checked_add(1)?,
                next_phase: None,
            }),
        }
    }

    /// The phase that will actually run first.
    pub fn entry_phase(&self) -> Phase {
        self.next_phase.unwrap_or(Phase::Optimization)
    }

    /// Whether this resume point lies strictly before `other` in execution order.
    pub fn precedes(&self, other: &ResumePoint) -> bool {
        (self.iteration, self.entry_phase()) < (other.iteration, other.entry_phase())
    }
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.next_phase {
            Some(phase) => write!(f, "iteration {} at {}", self.iteration, phase),
            None => write!(f, "iteration {} from the start", self.iteration),
        }
    }
}
