//! Optimizer result records and candidate selection.
//!
//! The optimizer writes one JSON object per evaluated candidate to
//! `<t>bo.log`, optionally behind a `<timestamp>, <LEVEL>: ` prefix:
//!
//! ```text
//! {"pruning_config": {"conv1": 0.12, "fc6": 0.81}, "latency": 142.7, "accuracy": 0.551}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FinepruneError, Result};
use crate::run_log::LogEntry;

/// One candidate evaluated by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Prune ratio per layer, each within `[0, 1]`.
    #[serde(alias = "pruning_dict")]
    pub pruning_config: BTreeMap<String, f64>,

    /// Measured latency in milliseconds.
    pub latency: f64,

    /// Measured accuracy within `[0, 1]`.
    pub accuracy: f64,
}

impl ResultRecord {
    /// Check the measured values and ratios are in range.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.latency.is_finite() || self.latency < 0.0 {
            return Err(format!("latency {} is not a valid duration", self.latency));
        }
        if !(0.0..=1.0).contains(&self.accuracy) {
            return Err(format!("accuracy {} is outside [0, 1]", self.accuracy));
        }
        if let Some((layer, ratio)) = self
            .pruning_config
            .iter()
            .find(|(_, ratio)| !(0.0..=1.0).contains(*ratio))
        {
            return Err(format!("prune ratio {ratio} of layer {layer} is outside [0, 1]"));
        }
        Ok(())
    }

    /// Whether the record meets `constraint`.
    pub fn is_feasible(&self, constraint: f64) -> bool {
        self.latency <= constraint
    }
}

fn parse_line(line: &str) -> Option<std::result::Result<ResultRecord, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let body = match LogEntry::parse(trimmed) {
        Some(entry) => entry.message,
        None => trimmed.to_string(),
    };
    if !body.trim_start().starts_with('{') {
        return Some(Err("not a JSON record".to_string()));
    }
    let parsed = serde_json::from_str::<ResultRecord>(&body)
        .map_err(|e| e.to_string())
        .and_then(|record| record.validate().map(|()| record));
    Some(parsed)
}

/// Parse result records from the text of a result log.
///
/// Lines that are blank are skipped silently; malformed or out-of-range
/// lines are skipped with a warning.
pub fn parse_records(text: &str) -> Vec<ResultRecord> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        match parse_line(line) {
            None => {}
            Some(Ok(record)) => records.push(record),
            Some(Err(reason)) => {
                warn!(line = index + 1, reason = %reason, "skipping result log line");
            }
        }
    }
    records
}

/// Load every record of a per-iteration result log.
pub fn load(path: &Path) -> Result<Vec<ResultRecord>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FinepruneError::ResultLogMissing(path.to_path_buf())
        } else {
            FinepruneError::Io(e)
        }
    })?;
    Ok(parse_records(&text))
}

/// The feasible record with strictly maximal accuracy.
///
/// Ties keep the first-seen record. `None` when nothing meets `constraint`.
pub fn select_best(records: &[ResultRecord], constraint: f64) -> Option<&ResultRecord> {
    let mut best: Option<&ResultRecord> = None;
    for record in records.iter().filter(|r| r.is_feasible(constraint)) {
        match best {
            Some(current) if record.accuracy <= current.accuracy => {}
            _ => best = Some(record),
        }
    }
    best
}

/// The record with the lowest latency, regardless of constraint.
///
/// Ties keep the more accurate record, then the first-seen one.
pub fn select_fastest(records: &[ResultRecord]) -> Option<&ResultRecord> {
    let mut best: Option<&ResultRecord> = None;
    for record in records {
        let better = match best {
            None => true,
            Some(current) => {
                record.latency < current.latency
                    || (record.latency == current.latency && record.accuracy > current.accuracy)
            }
        };
        if better {
            best = Some(record);
        }
    }
    best
}
