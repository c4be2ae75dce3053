//! Per-run output records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlguard_core::{Reason, ValidatorKind};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::controller::HaltReason;
use crate::RuntimeError;

/// Whether a run consulted a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintMode {
    None,
    Guarded,
}

/// Everything one decode run reports.
///
/// `reject_reason_histogram` counts every probe, accepted or not, by reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub model: String,
    pub device: String,
    pub max_new_tokens: usize,
    pub constraint: ConstraintMode,

    /// Validator variant for guarded runs
    #[serde(default)]
    pub guard: Option<ValidatorKind>,

    pub top_k: usize,
    pub accepted_tokens: usize,
    pub rejected_tokens: usize,
    pub dead_end: bool,
    pub halt_reason: HaltReason,
    pub total_time_ms: f64,
    pub avg_time_per_attempt_ms: f64,
    pub reject_reason_histogram: BTreeMap<Reason, usize>,
    pub prompt: String,

    /// Prompt followed by the generated text
    pub output_text: String,

    pub started_at: DateTime<Utc>,
}

impl RunRecord {
    /// Write the record as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        write_json(self, path)
    }

    /// Load a record written by [`RunRecord::write_json`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// `total / max(attempts, 1)`.
pub(crate) fn avg_per_attempt(total_ms: f64, attempts: usize) -> f64 {
    total_ms / attempts.max(1) as f64
}

/// Write any serialisable value as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    tracing::info!(path = %path.display(), "wrote json");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunRecord {
        let mut histogram = BTreeMap::new();
        histogram.insert(Reason::Incomplete, 2);
        histogram.insert(Reason::ParseError, 1);

        RunRecord {
            model: "scripted".to_string(),
            device: "cpu".to_string(),
            max_new_tokens: 8,
            constraint: ConstraintMode::Guarded,
            guard: Some(ValidatorKind::Grammar),
            top_k: 3,
            accepted_tokens: 2,
            rejected_tokens: 1,
            dead_end: false,
            halt_reason: HaltReason::StepBudgetExhausted,
            total_time_ms: 9.0,
            avg_time_per_attempt_ms: 3.0,
            reject_reason_histogram: histogram,
            prompt: "-- q\n".to_string(),
            output_text: "-- q\nSELECT * ".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_field_names_in_json() {
        let value = serde_json::to_value(sample()).unwrap();
        for key in [
            "model",
            "device",
            "max_new_tokens",
            "constraint",
            "top_k",
            "accepted_tokens",
            "rejected_tokens",
            "dead_end",
            "total_time_ms",
            "avg_time_per_attempt_ms",
            "reject_reason_histogram",
            "output_text",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["constraint"], "guarded");
        assert_eq!(value["reject_reason_histogram"]["parse_error"], 1);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("000_guarded.json");

        let record = sample();
        record.write_json(&path).unwrap();

        let back = RunRecord::from_json_file(&path).unwrap();
        assert_eq!(back.accepted_tokens, record.accepted_tokens);
        assert_eq!(back.reject_reason_histogram, record.reject_reason_histogram);
    }

    #[test]
    fn test_avg_per_attempt_never_divides_by_zero() {
        assert_eq!(avg_per_attempt(5.0, 0), 5.0);
        assert_eq!(avg_per_attempt(6.0, 3), 2.0);
    }
}
