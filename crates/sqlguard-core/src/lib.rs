//! # sqlguard-core
//!
//! Incremental SQL validity guard for constrained decoding.
//!
//! A guard accumulates generated text fragment by fragment and classifies
//! the running buffer as valid, valid-but-incomplete, or invalid SQL. A
//! decoder uses it to reject continuations that would make the statement
//! ungrammatical.
//!
//! ## Key Guarantees
//!
//! 1. **Chunking-independent**: the verdict depends only on the final text
//! 2. **Pre-select pass-through**: text before the first `select` is never
//!    rejected (when enabled)
//! 3. **Strict on `;`**: a terminated statement gets no incomplete leniency
//! 4. **No shared state**: each validator owns its buffer
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlguard_core::{ConstraintValidator, GuardConfig, Reason, SqlGuard};
//!
//! let mut guard = SqlGuard::new(GuardConfig::default())?;
//! guard.reset();
//! for fragment in ["SELECT ", "* ", "FROM ", "author", ";"] {
//!     let outcome = guard.step(fragment)?;
//!     assert!(outcome.accepted);
//! }
//! ```

pub mod config;
pub mod outcome;
pub mod validators;

pub use config::{ConfigError, GuardFile};
pub use outcome::{Reason, ValidationOutcome};
pub use validators::{
    check_sql, AdapterBackend, AdapterConfig, AdapterVerdict, ConstraintValidator, ExternalAdapter,
    GuardConfig, GuardSpec, SqlGuard, Validator, ValidatorKind,
};

use thiserror::Error;

/// Errors raised by validators.
///
/// Parse failures are not errors: they come back as rejected outcomes.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Unknown SQL dialect: {0}")]
    UnknownDialect(String),

    /// The external checker cannot run at all. Aborts a decode run.
    #[error("Adapter environment error: {0}")]
    Environment(String),

    /// Unexpected validator failure. Callers fail closed.
    #[error("Validator internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Whether the error must abort a run instead of rejecting a candidate.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GuardError::Internal(_))
    }
}

/// Judge `sql` in one shot with a fresh validator.
pub fn validate(spec: &GuardSpec, sql: &str) -> Result<ValidationOutcome, GuardError> {
    let mut validator = spec.build()?;
    validator.reset();
    validator.step(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_one_shot() {
        let spec = GuardSpec::default();

        let outcome = validate(&spec, "SELECT * FROM author;").unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.reason, Reason::None);

        let outcome = validate(&spec, "SELECT FROM ;").unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, Reason::ParseError);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GuardError::Environment("root missing".into()).is_fatal());
        assert!(GuardError::UnknownDialect("x".into()).is_fatal());
        assert!(!GuardError::Internal("boom".into()).is_fatal());
    }
}
