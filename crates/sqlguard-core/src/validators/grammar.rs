//! Grammar-based guard backed by `sqlparser`.
//!
//! Every step re-parses the whole accumulated buffer. Cost grows with the
//! square of the generated length, but the verdict depends only on the final
//! text, so feeding a statement whole or fragment by fragment gives the
//! same answer.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement};
use sqlparser::dialect::{dialect_from_str, Dialect};
use sqlparser::keywords::{ALL_KEYWORDS, ALL_KEYWORDS_INDEX, RESERVED_FOR_COLUMN_ALIAS};
use sqlparser::parser::Parser;

use crate::outcome::{Reason, ValidationOutcome};
use crate::GuardError;

use super::{ConstraintValidator, ValidatorKind};

/// Parser diagnostics containing any of these (lower-cased) read as
/// "the statement is merely cut short".
///
/// Matching the parser's wording is brittle: if `sqlparser` rephrases its
/// errors, lenient mode degrades to rejecting everything.
const INCOMPLETE_SIGNALS: &[&str] = &["expected", "missing", "end of input", "eof", "unterminated"];

fn default_dialect() -> String {
    "sqlite".to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration for [`SqlGuard`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// `sqlparser` dialect name (e.g. "sqlite", "postgres", "generic")
    #[serde(default = "default_dialect")]
    pub dialect: String,

    /// Pass any text through until a `select` keyword shows up
    #[serde(default = "default_true")]
    pub allow_before_select: bool,

    /// Accept unterminated statements whose parse error looks like truncation
    #[serde(default = "default_true")]
    pub treat_incomplete_as_ok: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            allow_before_select: true,
            treat_incomplete_as_ok: true,
        }
    }
}

impl GuardConfig {
    /// Config for the given dialect with the default leniency settings.
    pub fn with_dialect(dialect: impl Into<String>) -> Self {
        Self {
            dialect: dialect.into(),
            ..Default::default()
        }
    }

    /// Strict mode: no pre-select pass-through, no incomplete leniency.
    pub fn strict(mut self) -> Self {
        self.allow_before_select = false;
        self.treat_incomplete_as_ok = false;
        self
    }
}

/// Resolve a dialect name the way `sqlparser` spells them.
pub(crate) fn resolve_dialect(name: &str) -> Result<Box<dyn Dialect>, GuardError> {
    dialect_from_str(name).ok_or_else(|| GuardError::UnknownDialect(name.to_string()))
}

/// Streaming SQL validity guard.
#[derive(Debug, Clone)]
pub struct SqlGuard {
    config: GuardConfig,
    buffer: String,
}

impl SqlGuard {
    /// Create a guard, failing early on an unknown dialect.
    pub fn new(config: GuardConfig) -> Result<Self, GuardError> {
        resolve_dialect(&config.dialect)?;
        Ok(Self {
            config,
            buffer: String::new(),
        })
    }

    /// Classify `text` as a whole, without touching the buffer.
    pub fn check(&self, text: &str) -> Result<ValidationOutcome, GuardError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(ValidationOutcome::accept(Reason::None, text));
        }

        if self.config.allow_before_select && !trimmed.to_lowercase().contains("select") {
            return Ok(ValidationOutcome::accept(Reason::PreSelect, text));
        }

        // A terminated statement is judged strictly.
        let finished = trimmed.ends_with(';');

        let dialect = resolve_dialect(&self.config.dialect)?;
        match parse_single_statement(dialect.as_ref(), trimmed) {
            Ok(()) => Ok(ValidationOutcome::accept(Reason::None, text)),
            Err(message) => {
                if !finished && self.config.treat_incomplete_as_ok && looks_incomplete(&message) {
                    Ok(ValidationOutcome::accept(Reason::Incomplete, text))
                } else {
                    tracing::trace!(error = %message, "statement rejected by parser");
                    Ok(ValidationOutcome::reject(Reason::ParseError, text))
                }
            }
        }
    }
}

impl ConstraintValidator for SqlGuard {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Grammar
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn step(&mut self, fragment: &str) -> Result<ValidationOutcome, GuardError> {
        self.buffer.push_str(fragment);
        let outcome = self.check(&self.buffer)?;
        tracing::debug!(
            accepted = outcome.accepted,
            reason = %outcome.reason,
            buffer_len = self.buffer.len(),
            "grammar guard step"
        );
        Ok(outcome)
    }

    fn buffer(&self) -> &str {
        &self.buffer
    }
}

fn looks_incomplete(message: &str) -> bool {
    let lowered = message.to_lowercase();
    INCOMPLETE_SIGNALS.iter().any(|signal| lowered.contains(signal))
}

/// Parse `sql` as exactly one statement, returning the parser's diagnostic
/// text on failure.
fn parse_single_statement(dialect: &dyn Dialect, sql: &str) -> Result<(), String> {
    let statements = Parser::parse_sql(dialect, sql).map_err(|e| e.to_string())?;
    match statements.as_slice() {
        [statement] => reject_keyword_projection(statement),
        [] => Err("no statement found".to_string()),
        many => Err(format!("{} statements given, only one is allowed", many.len())),
    }
}

/// `SELECT FROM t` must not parse as a column named `FROM`.
fn reject_keyword_projection(statement: &Statement) -> Result<(), String> {
    let Statement::Query(query) = statement else {
        return Ok(());
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Ok(());
    };

    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        if let Expr::Identifier(ident) = expr {
            if ident.quote_style.is_none() && is_reserved_for_column_alias(&ident.value) {
                return Err(format!(
                    "Expected: an expression, found: {}",
                    ident.value.to_uppercase()
                ));
            }
        }
    }

    Ok(())
}

fn is_reserved_for_column_alias(word: &str) -> bool {
    let upper = word.to_uppercase();
    ALL_KEYWORDS
        .binary_search(&upper.as_str())
        .map(|idx| RESERVED_FOR_COLUMN_ALIAS.contains(&ALL_KEYWORDS_INDEX[idx]))
        .unwrap_or(false)
}
