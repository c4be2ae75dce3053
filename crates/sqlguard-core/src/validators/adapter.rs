//! External-adapter guard.
//!
//! Delegates the verdict to an outside checker with a tri-state contract:
//! exit code 0 = valid, 1 = invalid, 2 = environment/configuration error.
//! The checker can run as a subprocess per probe or in-process; both paths
//! map onto [`AdapterVerdict`].
//!
//! The bundled checker is a smoke-test heuristic, not a grammar: it only
//! looks for a non-empty `SELECT <payload> FROM <payload>` shape.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::outcome::{Reason, ValidationOutcome};
use crate::GuardError;

use super::{ConstraintValidator, ValidatorKind};

lazy_static! {
    /// `SELECT <something> FROM <something>`, case-insensitive, across lines.
    static ref SELECT_FROM_PATTERN: Regex = Regex::new(
        r"(?is)\bselect\b\s+(.+?)\s+\bfrom\b\s+(.+?)(;|\s|$)"
    ).unwrap();
}

/// Verdict of the external checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterVerdict {
    Valid,
    Invalid,
    /// Checker could not run properly (missing root, bad setup). Fatal.
    EnvironmentError,
}

impl AdapterVerdict {
    /// Map a process exit code; unknown codes yield `None`.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Valid),
            1 => Some(Self::Invalid),
            2 => Some(Self::EnvironmentError),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Valid => 0,
            Self::Invalid => 1,
            Self::EnvironmentError => 2,
        }
    }
}

/// How the adapter reaches the checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterBackend {
    /// Call [`check_sql`] directly
    InProcess,

    /// Spawn `<program> <args..> --sql <text> --root <root>` per probe
    Subprocess {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for AdapterBackend {
    fn default() -> Self {
        Self::InProcess
    }
}

/// Configuration for [`ExternalAdapter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Root directory of the external tool; must exist
    pub root: PathBuf,

    #[serde(default)]
    pub backend: AdapterBackend,
}

impl AdapterConfig {
    pub fn in_process(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: AdapterBackend::InProcess,
        }
    }

    pub fn subprocess(
        root: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            backend: AdapterBackend::Subprocess {
                program: program.into(),
                args,
            },
        }
    }
}

/// The smoke-test checker behind the adapter contract.
pub fn check_sql(sql: &str, root: &Path) -> AdapterVerdict {
    if !root.exists() {
        return AdapterVerdict::EnvironmentError;
    }

    let sql = sql.trim();
    if sql.is_empty() {
        return AdapterVerdict::Invalid;
    }

    let Some(captures) = SELECT_FROM_PATTERN.captures(sql) else {
        return AdapterVerdict::Invalid;
    };

    let select_part = captures.get(1).map_or("", |m| m.as_str()).trim();
    let from_part = captures.get(2).map_or("", |m| m.as_str()).trim();

    if is_blank_payload(select_part) || is_blank_payload(from_part) {
        return AdapterVerdict::Invalid;
    }

    AdapterVerdict::Valid
}

/// Empty, or nothing but separators (`SELECT , FROM ;`).
///
/// Only `,` and `;` count as blank. Other punctuation stays meaningful:
/// `*` is a whole projection, and `(` or `.` may open a valid expression.
fn is_blank_payload(payload: &str) -> bool {
    payload.chars().all(|ch| ch == ',' || ch == ';')
}

/// Guard that defers every verdict to the external checker.
///
/// It cannot tell a truncated statement from a broken one, so every
/// rejection carries [`Reason::Rejected`].
#[derive(Debug, Clone)]
pub struct ExternalAdapter {
    config: AdapterConfig,
    buffer: String,
}

impl ExternalAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    fn judge(&self, sql: &str) -> Result<AdapterVerdict, GuardError> {
        match &self.config.backend {
            AdapterBackend::InProcess => Ok(check_sql(sql, &self.config.root)),
            AdapterBackend::Subprocess { program, args } => {
                run_checker(program, args, sql, &self.config.root)
            }
        }
    }
}

impl ConstraintValidator for ExternalAdapter {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::External
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn step(&mut self, fragment: &str) -> Result<ValidationOutcome, GuardError> {
        self.buffer.push_str(fragment);

        let outcome = match self.judge(&self.buffer)? {
            AdapterVerdict::Valid => ValidationOutcome::accept(Reason::None, self.buffer.as_str()),
            AdapterVerdict::Invalid => {
                ValidationOutcome::reject(Reason::Rejected, self.buffer.as_str())
            }
            AdapterVerdict::EnvironmentError => {
                return Err(GuardError::Environment(format!(
                    "external checker cannot run with root {}",
                    self.config.root.display()
                )));
            }
        };

        tracing::debug!(
            accepted = outcome.accepted,
            buffer_len = self.buffer.len(),
            "external adapter step"
        );
        Ok(outcome)
    }

    fn buffer(&self) -> &str {
        &self.buffer
    }
}

fn run_checker(
    program: &Path,
    args: &[String],
    sql: &str,
    root: &Path,
) -> Result<AdapterVerdict, GuardError> {
    let output = Command::new(program)
        .args(args)
        .arg("--sql")
        .arg(sql)
        .arg("--root")
        .arg(root)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            GuardError::Environment(format!("failed to launch {}: {}", program.display(), e))
        })?;

    let Some(code) = output.status.code() else {
        return Err(GuardError::Internal(format!(
            "{} terminated without an exit code",
            program.display()
        )));
    };

    match AdapterVerdict::from_exit_code(code) {
        Some(AdapterVerdict::EnvironmentError) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(GuardError::Environment(format!(
                "{} reported an environment error: {}",
                program.display(),
                stderr.trim()
            )))
        }
        Some(verdict) => Ok(verdict),
        None => Err(GuardError::Internal(format!(
            "{} exited with unexpected code {}",
            program.display(),
            code
        ))),
    }
}
