//! # sqlguard-runtime
//!
//! Guarded decoding on top of `sqlguard-core`.
//!
//! A [`DecodeController`] pulls ranked candidates from a
//! [`CandidateSource`] (normally a language model), probes them against a
//! fresh validator, and commits the best-ranked one that keeps the SQL
//! valid. The run ends at the source's end marker, at the step budget, or
//! in a dead end when every candidate of a step is rejected.
//!
//! ## Error policy
//! - parse failures never surface as errors; they are rejected candidates
//! - unexpected validator failures reject the candidate (fail closed)
//! - adapter environment errors abort the run with no record
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlguard_runtime::{DecodeConfig, DecodeController, ScriptedSource};
//! use sqlguard_core::GuardSpec;
//!
//! let source = ScriptedSource::from_rows(&[&["SELECT ", "FROM "], &["* "]]);
//! let config = DecodeConfig::guarded(GuardSpec::default(), 64, 3);
//! let run = DecodeController::new(source, config).run("-- authors\n").await?;
//! println!("{}", run.record.output_text);
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod controller;
pub mod record;
pub mod source;
pub mod toy;

pub use batch::{merge_summaries, summarize, BatchReport, BatchRunner, ModeSummary, PromptRuns, TopKSummary};
pub use config::BatchConfig;
pub use controller::{DecodeConfig, DecodeController, DecodeRun, DecodeState, DecodeStatus, HaltReason};
pub use record::{write_json, ConstraintMode, RunRecord};
pub use source::{Candidate, CandidateSource, DecodeScript, ScriptedPrompt, ScriptedSource, SourceError};

use sqlguard_core::GuardError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The external checker cannot run. Fatal for the run.
    #[error("Adapter environment error: {0}")]
    Adapter(String),

    #[error("Validator configuration error: {0}")]
    Guard(GuardError),

    #[error("Candidate source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<GuardError> for RuntimeError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::Environment(message) => RuntimeError::Adapter(message),
            other => RuntimeError::Guard(other),
        }
    }
}

impl RuntimeError {
    /// Whether this is the fatal adapter case, reported with its own exit status.
    pub fn is_adapter_fatal(&self) -> bool {
        matches!(self, RuntimeError::Adapter(_))
    }
}
