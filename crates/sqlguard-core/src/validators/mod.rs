//! Constraint validators.
//!
//! Two variants exist and the set is closed:
//! - [`SqlGuard`]: grammar-based, backed by `sqlparser`
//! - [`ExternalAdapter`]: defers to an external checker
//!
//! Both own a buffer of accepted text. `step` appends the fragment and
//! re-judges the whole buffer, so the final verdict depends only on the
//! final text, never on how it was chunked.

mod adapter;
mod grammar;

pub use adapter::{check_sql, AdapterBackend, AdapterConfig, AdapterVerdict, ExternalAdapter};
pub use grammar::{GuardConfig, SqlGuard};

use serde::{Deserialize, Serialize};

use crate::outcome::ValidationOutcome;
use crate::GuardError;

/// Which validator variant produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    Grammar,
    External,
}

impl ValidatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorKind::Grammar => "grammar",
            ValidatorKind::External => "external",
        }
    }
}

/// Interface shared by every validator.
///
/// # Contract
/// - `reset` empties the buffer and may be called any number of times
/// - `step` mutates nothing but the buffer
/// - feeding `f1..fn` yields the same final outcome as feeding their
///   concatenation in one call
pub trait ConstraintValidator {
    fn kind(&self) -> ValidatorKind;

    /// Clear the accepted-text buffer.
    fn reset(&mut self);

    /// Append `fragment` and judge the whole buffer.
    fn step(&mut self, fragment: &str) -> Result<ValidationOutcome, GuardError>;

    /// Text accumulated since the last reset.
    fn buffer(&self) -> &str;
}

/// One of the two validator variants.
#[derive(Debug, Clone)]
pub enum Validator {
    Grammar(SqlGuard),
    External(ExternalAdapter),
}

impl ConstraintValidator for Validator {
    fn kind(&self) -> ValidatorKind {
        match self {
            Validator::Grammar(v) => v.kind(),
            Validator::External(v) => v.kind(),
        }
    }

    fn reset(&mut self) {
        match self {
            Validator::Grammar(v) => v.reset(),
            Validator::External(v) => v.reset(),
        }
    }

    fn step(&mut self, fragment: &str) -> Result<ValidationOutcome, GuardError> {
        match self {
            Validator::Grammar(v) => v.step(fragment),
            Validator::External(v) => v.step(fragment),
        }
    }

    fn buffer(&self) -> &str {
        match self {
            Validator::Grammar(v) => v.buffer(),
            Validator::External(v) => v.buffer(),
        }
    }
}

/// Recipe for building independent validators.
///
/// The decode controller builds a fresh validator from this for every
/// probe, so a rejected candidate never leaves state behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardSpec {
    Grammar(GuardConfig),
    External(AdapterConfig),
}

impl GuardSpec {
    /// Build a fresh, reset validator.
    pub fn build(&self) -> Result<Validator, GuardError> {
        match self {
            GuardSpec::Grammar(config) => Ok(Validator::Grammar(SqlGuard::new(config.clone())?)),
            GuardSpec::External(config) => {
                Ok(Validator::External(ExternalAdapter::new(config.clone())))
            }
        }
    }

    pub fn kind(&self) -> ValidatorKind {
        match self {
            GuardSpec::Grammar(_) => ValidatorKind::Grammar,
            GuardSpec::External(_) => ValidatorKind::External,
        }
    }
}

impl Default for GuardSpec {
    fn default() -> Self {
        GuardSpec::Grammar(GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Reason;

    #[test]
    fn test_spec_builds_matching_variant() {
        let validator = GuardSpec::default().build().unwrap();
        assert_eq!(validator.kind(), ValidatorKind::Grammar);

        let validator = GuardSpec::External(AdapterConfig::in_process("/tmp"))
            .build()
            .unwrap();
        assert_eq!(validator.kind(), ValidatorKind::External);
    }

    #[test]
    fn test_built_validators_are_independent() {
        let spec = GuardSpec::default();
        let mut first = spec.build().unwrap();
        let second = spec.build().unwrap();

        first.step("SELECT a FROM t").unwrap();
        assert_eq!(first.buffer(), "SELECT a FROM t");
        assert_eq!(second.buffer(), "");
    }

    #[test]
    fn test_enum_delegates_step() {
        let mut validator = GuardSpec::default().build().unwrap();
        let outcome = validator.step("SELECT FROM ;").unwrap();
        assert_eq!(outcome.reason, Reason::ParseError);

        validator.reset();
        assert_eq!(validator.buffer(), "");
    }

    #[test]
    fn test_spec_serde_tagging() {
        let spec: GuardSpec = serde_json::from_str(
            r#"{"kind": "grammar", "dialect": "postgres", "treat_incomplete_as_ok": false}"#,
        )
        .unwrap();
        match spec {
            GuardSpec::Grammar(config) => {
                assert_eq!(config.dialect, "postgres");
                assert!(config.allow_before_select);
                assert!(!config.treat_incomplete_as_ok);
            }
            GuardSpec::External(_) => panic!("expected grammar spec"),
        }
    }

    #[test]
    fn test_unknown_dialect_spec_fails_to_build() {
        let spec = GuardSpec::Grammar(GuardConfig::with_dialect("klingon"));
        assert!(matches!(spec.build(), Err(GuardError::UnknownDialect(_))));
    }
}
