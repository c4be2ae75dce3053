//! Candidate sources: whatever proposes ranked next fragments.
//!
//! A real source wraps a language model's forward pass and tokenizer. This
//! crate only ships [`ScriptedSource`], a deterministic stand-in driven by
//! a per-step table of ranked fragments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::BatchConfig;

/// Errors from candidate sources.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read decode script: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse decode script: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Decode script has no prompt #{0}")]
    MissingPrompt(usize),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A ranked fragment proposed for the next position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,

    /// 0 = most preferred
    pub rank: usize,
}

impl Candidate {
    pub fn new(text: impl Into<String>, rank: usize) -> Self {
        Self {
            text: text.into(),
            rank,
        }
    }
}

/// Proposes ranked continuations for a decode run.
///
/// # Contract
/// - returns at most `k` candidates, best first
/// - ties are broken by the source, never by the caller
/// - the source decides what its end-of-sequence marker looks like
#[async_trait]
pub trait CandidateSource: Send {
    /// Identifier of the underlying model.
    fn model_id(&self) -> &str;

    /// Where inference runs.
    fn device(&self) -> &str {
        "cpu"
    }

    /// Fragment that ends generation once committed.
    fn end_marker(&self) -> &str;

    /// Top-`k` candidates for the position after `context`.
    ///
    /// `context` is the prompt followed by everything committed so far.
    async fn candidates(&mut self, context: &str, k: usize) -> Result<Vec<Candidate>, SourceError>;
}

/// Replays a fixed table of ranked fragments, one row per decode step.
///
/// Once the table runs out, only the end marker is offered.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    model: String,
    device: String,
    end_marker: String,
    steps: Vec<Vec<String>>,
    cursor: usize,
}

impl ScriptedSource {
    pub fn new(model: impl Into<String>, end_marker: impl Into<String>, steps: Vec<Vec<String>>) -> Self {
        Self {
            model: model.into(),
            device: "cpu".to_string(),
            end_marker: end_marker.into(),
            steps,
            cursor: 0,
        }
    }

    /// Convenience for tests and demos.
    pub fn from_rows(rows: &[&[&str]]) -> Self {
        let steps = rows
            .iter()
            .map(|row| row.iter().map(|s| s.to_string()).collect())
            .collect();
        Self::new("scripted", default_end_marker(), steps)
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Number of steps served so far.
    pub fn steps_served(&self) -> usize {
        self.cursor
    }
}

#[async_trait]
impl CandidateSource for ScriptedSource {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn end_marker(&self) -> &str {
        &self.end_marker
    }

    async fn candidates(&mut self, _context: &str, k: usize) -> Result<Vec<Candidate>, SourceError> {
        let row = match self.steps.get(self.cursor) {
            Some(row) => row.clone(),
            None => vec![self.end_marker.clone()],
        };
        self.cursor += 1;

        Ok(row
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, text)| Candidate { text, rank })
            .collect())
    }
}

fn default_model() -> String {
    "scripted".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_end_marker() -> String {
    "</s>".to_string()
}

/// One prompt of a decode script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedPrompt {
    pub prompt: String,

    /// Ranked fragments per decode step
    #[serde(default)]
    pub steps: Vec<Vec<String>>,
}

/// YAML description of scripted decode runs.
///
/// ```yaml
/// model: toy-sql
/// end_marker: "</s>"
/// batch:
///   concurrency: 4
///   run_timeout: 30s
/// prompts:
///   - prompt: "-- all authors\n"
///     steps:
///       - ["SELECT ", "FROM "]
///       - ["* "]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeScript {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_end_marker")]
    pub end_marker: String,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub prompts: Vec<ScriptedPrompt>,
}

impl DecodeScript {
    pub fn from_yaml(yaml: &str) -> Result<Self, SourceError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Prompt texts in script order.
    pub fn prompt_texts(&self) -> Vec<String> {
        self.prompts.iter().map(|p| p.prompt.clone()).collect()
    }

    /// Fresh source for prompt `index`.
    pub fn source_for(&self, index: usize) -> Result<ScriptedSource, SourceError> {
        let prompt = self
            .prompts
            .get(index)
            .ok_or(SourceError::MissingPrompt(index))?;

        Ok(
            ScriptedSource::new(&self.model, &self.end_marker, prompt.steps.clone())
                .with_device(&self.device),
        )
    }
}
