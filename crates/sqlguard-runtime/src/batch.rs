//! Batch runs and their summaries.
//!
//! For every prompt the runner decodes twice, once unconstrained and once
//! guarded, each with its own source and validator. Prompts may run
//! concurrently since nothing is shared between runs. Summaries are plain
//! functions over finished records.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlguard_core::GuardSpec;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::BatchConfig;
use crate::controller::{DecodeConfig, DecodeController};
use crate::record::{ConstraintMode, RunRecord};
use crate::source::{CandidateSource, SourceError};
use crate::RuntimeError;

/// Averages over the runs of one constraint mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeSummary {
    pub n: usize,
    pub avg_accepted: f64,
    pub avg_rejected: f64,
    pub avg_ms: f64,
}

/// Per-mode summaries, keyed `none` / `guarded`.
pub type ModeSummaries = BTreeMap<ConstraintMode, ModeSummary>;

/// Summarize finished runs. An empty slice gives all zeros.
pub fn summarize(records: &[RunRecord]) -> ModeSummary {
    let n = records.len();
    if n == 0 {
        return ModeSummary::default();
    }

    let mean = |f: fn(&RunRecord) -> f64| records.iter().map(f).sum::<f64>() / n as f64;

    ModeSummary {
        n,
        avg_accepted: mean(|r: &RunRecord| r.accepted_tokens as f64),
        avg_rejected: mean(|r: &RunRecord| r.rejected_tokens as f64),
        avg_ms: mean(|r: &RunRecord| r.avg_time_per_attempt_ms),
    }
}

/// Both runs for one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRuns {
    pub i: usize,
    pub prompt: String,
    pub none: RunRecord,
    pub guarded: RunRecord,
}

/// Output of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub model: String,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub summary: ModeSummaries,
    pub per_prompt: Vec<PromptRuns>,
}

impl BatchReport {
    fn from_runs(max_new_tokens: usize, top_k: usize, per_prompt: Vec<PromptRuns>) -> Self {
        let model = per_prompt
            .first()
            .map(|p| p.none.model.clone())
            .unwrap_or_default();

        let none: Vec<RunRecord> = per_prompt.iter().map(|p| p.none.clone()).collect();
        let guarded: Vec<RunRecord> = per_prompt.iter().map(|p| p.guarded.clone()).collect();

        let mut summary = ModeSummaries::new();
        summary.insert(ConstraintMode::None, summarize(&none));
        summary.insert(ConstraintMode::Guarded, summarize(&guarded));

        Self {
            model,
            max_new_tokens,
            top_k,
            summary,
            per_prompt,
        }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        crate::record::write_json(self, path)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Summaries of several batches under a label each (e.g. `top_k=1`).
pub type TopKSummary = BTreeMap<String, ModeSummaries>;

/// Merge labelled batch reports into one comparison table.
pub fn merge_summaries<'a>(
    reports: impl IntoIterator<Item = (&'a str, &'a BatchReport)>,
) -> TopKSummary {
    reports
        .into_iter()
        .map(|(label, report)| (label.to_string(), report.summary.clone()))
        .collect()
}

/// Runs a batch of prompts in both modes.
pub struct BatchRunner {
    max_new_tokens: usize,
    top_k: usize,
    guard: GuardSpec,
    probe_cache_capacity: Option<u64>,
    batch: BatchConfig,
}

impl BatchRunner {
    pub fn new(guard: GuardSpec, max_new_tokens: usize, top_k: usize) -> Self {
        Self {
            max_new_tokens,
            top_k,
            guard,
            probe_cache_capacity: None,
            batch: BatchConfig::default(),
        }
    }

    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_probe_cache(mut self, capacity: u64) -> Self {
        self.probe_cache_capacity = Some(capacity);
        self
    }

    /// Decode every prompt. `make_source(i)` must return a fresh source
    /// for prompt `i` on every call.
    pub async fn run<S, F>(&self, prompts: &[String], make_source: F) -> Result<BatchReport, RuntimeError>
    where
        S: CandidateSource,
        F: Fn(usize) -> Result<S, SourceError>,
    {
        let concurrency = self.batch.concurrency.max(1);
        tracing::info!(prompts = prompts.len(), concurrency, "batch started");

        let make_source = &make_source;
        let per_prompt: Vec<PromptRuns> = stream::iter(prompts.iter().enumerate())
            .map(|(i, prompt)| async move {
                let none = self
                    .run_one(make_source(i)?, self.unconstrained(), prompt)
                    .await?;
                let guarded = self
                    .run_one(make_source(i)?, self.guarded(), prompt)
                    .await?;
                Ok::<_, RuntimeError>(PromptRuns {
                    i,
                    prompt: prompt.clone(),
                    none,
                    guarded,
                })
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        Ok(BatchReport::from_runs(self.max_new_tokens, self.top_k, per_prompt))
    }

    fn unconstrained(&self) -> DecodeConfig {
        DecodeConfig::unconstrained(self.max_new_tokens, self.top_k)
    }

    fn guarded(&self) -> DecodeConfig {
        let config = DecodeConfig::guarded(self.guard.clone(), self.max_new_tokens, self.top_k);
        match self.probe_cache_capacity {
            Some(capacity) => config.with_probe_cache(capacity),
            None => config,
        }
    }

    async fn run_one<S: CandidateSource>(
        &self,
        source: S,
        config: DecodeConfig,
        prompt: &str,
    ) -> Result<RunRecord, RuntimeError> {
        let mut controller = DecodeController::new(source, config);
        let run = match self.batch.run_timeout {
            Some(limit) => tokio::time::timeout(limit, controller.run(prompt))
                .await
                .map_err(|_| RuntimeError::Timeout(limit))??,
            None => controller.run(prompt).await?,
        };
        Ok(run.record)
    }
}
