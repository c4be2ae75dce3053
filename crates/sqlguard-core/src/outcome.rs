//! Validation outcomes produced by every guard step.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a step was accepted or rejected.
///
/// Variants order the reject-reason histogram, so keep them stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Plain success (or the empty buffer)
    None,

    /// No `select` keyword seen yet; any text passes
    PreSelect,

    /// Parser failed, but the failure reads like a truncated statement
    Incomplete,

    /// Grammar rejects the statement
    ParseError,

    /// Generic rejection from the external adapter, which cannot tell
    /// truncation from a real error
    Rejected,
}

impl Reason {
    /// Snake-case label used in records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::None => "none",
            Reason::PreSelect => "pre_select",
            Reason::Incomplete => "incomplete",
            Reason::ParseError => "parse_error",
            Reason::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `step` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the accumulated text may be committed
    pub accepted: bool,

    /// Classification behind the verdict
    pub reason: Reason,

    /// Accumulated buffer at the time of the step
    pub snapshot: String,
}

impl ValidationOutcome {
    /// An accepting outcome.
    pub fn accept(reason: Reason, snapshot: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason,
            snapshot: snapshot.into(),
        }
    }

    /// A rejecting outcome.
    pub fn reject(reason: Reason, snapshot: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason,
            snapshot: snapshot.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&Reason::PreSelect).unwrap();
        assert_eq!(json, "\"pre_select\"");

        let back: Reason = serde_json::from_str("\"parse_error\"").unwrap();
        assert_eq!(back, Reason::ParseError);
    }

    #[test]
    fn test_reason_display_matches_serde() {
        for reason in [
            Reason::None,
            Reason::PreSelect,
            Reason::Incomplete,
            Reason::ParseError,
            Reason::Rejected,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json.trim_matches('"'), reason.to_string());
        }
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = ValidationOutcome::accept(Reason::Incomplete, "SELECT ");
        assert!(ok.is_accepted());
        assert_eq!(ok.snapshot, "SELECT ");

        let bad = ValidationOutcome::reject(Reason::ParseError, "SELECT FROM ;");
        assert!(!bad.is_accepted());
        assert_eq!(bad.reason, Reason::ParseError);
    }
}
