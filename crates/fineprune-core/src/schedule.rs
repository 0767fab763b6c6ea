//! Latency-constraint relaxation schedules.
//!
//! Early iterations get a looser latency constraint so the optimizer is not
//! forced to give up accuracy before the network has been pruned
//! incrementally. A schedule maps an iteration index to the threshold that
//! applies in that iteration:
//!
//! - `linear`: straight-line interpolation from the original latency
//! - `exponential`: Newton's-law-of-cooling curve, fast early and slow late
//! - `one-step`: the final constraint from the very first iteration
//!
//! Every kind reaches `final_latency` exactly at the last iteration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FinepruneError, Result};

/// Shape of the relaxation curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleKind {
    Linear,
    Exponential,
    OneStep,
}

impl ScheduleKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScheduleKind::Linear => "linear",
            ScheduleKind::Exponential => "exponential",
            ScheduleKind::OneStep => "one-step",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = FinepruneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(ScheduleKind::Linear),
            "exponential" => Ok(ScheduleKind::Exponential),
            "one-step" | "one_step" | "onestep" => Ok(ScheduleKind::OneStep),
            _ => Err(FinepruneError::UnsupportedScheduleKind {
                kind: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ScheduleKind {
    type Error = FinepruneError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScheduleKind> for String {
    fn from(kind: ScheduleKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relaxation schedule, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxationSchedule {
    /// Curve shape.
    pub kind: ScheduleKind,

    /// Latency of the unpruned model in milliseconds.
    pub original_latency: f64,

    /// Target latency the last iteration must meet.
    pub final_latency: f64,

    /// Number of fine-pruning iterations.
    pub total_iterations: u32,

    /// Cooling coefficient `k` of the exponential curve. Ignored by the other kinds.
    #[serde(default = "default_cooling_coefficient")]
    pub cooling_coefficient: f64,
}

fn default_cooling_coefficient() -> f64 {
    0.5
}

impl RelaxationSchedule {
    /// Check the schedule parameters.
    pub fn validate(&self) -> Result<()> {
        if self.total_iterations == 0 {
            return Err(FinepruneError::Configuration(
                "total_iterations must be greater than zero".to_string(),
            ));
        }
        if !self.original_latency.is_finite() || !self.final_latency.is_finite() {
            return Err(FinepruneError::Configuration(
                "latencies must be finite".to_string(),
            ));
        }
        if self.final_latency <= 0.0 {
            return Err(FinepruneError::Configuration(format!(
                "final latency must be positive, got {}",
                self.final_latency
            )));
        }
        if self.final_latency > self.original_latency {
            return Err(FinepruneError::Configuration(format!(
                "final latency {} exceeds original latency {}",
                self.final_latency, self.original_latency
            )));
        }
        if !self.cooling_coefficient.is_finite() || self.cooling_coefficient < 0.0 {
            return Err(FinepruneError::Configuration(format!(
                "cooling coefficient must be a non-negative number, got {}",
                self.cooling_coefficient
            )));
        }
        Ok(())
    }

    /// Latency threshold that applies in `iteration`.
    pub fn threshold(&self, iteration: u32) -> Result<f64> {
        if iteration >= self.total_iterations {
            return Err(FinepruneError::IterationOutOfRange {
                iteration,
                total: self.total_iterations,
            });
        }

        let original = self.original_latency;
        let target = self.final_latency;
        let total = f64::from(self.total_iterations);
        let step = f64::from(iteration) + 1.0;

        let value = match self.kind {
            ScheduleKind::Linear => original + step / total * (target - original),
            ScheduleKind::Exponential => {
                let k = self.cooling_coefficient;
                target + (original - target) * (-k * step).exp()
                    + (target - original) * (-k * (total + 1.0)).exp()
            }
            ScheduleKind::OneStep => target,
        };

        // Pin the last iteration so floating-point residue never leaves the
        // final constraint unmet.
        if iteration + 1 == self.total_iterations {
            return Ok(target);
        }
        Ok(value)
    }

    /// Constraint in force before `iteration` started.
    ///
    /// The original latency for the first iteration, otherwise the previous
    /// iteration's threshold.
    pub fn previous_threshold(&self, iteration: u32) -> Result<f64> {
        if iteration == 0 {
            Ok(self.original_latency)
        } else {
            self.threshold(iteration - 1)
        }
    }

    /// Thresholds for every iteration of the run, in order.
    pub fn thresholds(&self) -> Result<Vec<f64>> {
        (0..self.total_iterations)
            .map(|i| self.threshold(i))
            .collect()
    }
}

impl Default for RelaxationSchedule {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::Linear,
            original_latency: 238.0,
            final_latency: 80.0,
            total_iterations: 5,
            cooling_coefficient: default_cooling_coefficient(),
        }
    }
}
