//! Decode search controller.
//!
//! Drives one generation run. At every step it asks the source for the
//! top-`k` fragments and, when a guard is attached, probes them in rank
//! order against a fresh validator replaying the accepted prefix. The
//! first accepted candidate is committed; if none is, the run ends in a
//! dead end.
//!
//! # States
//! - `Running`
//! - `Halted(EndMarker | StepBudgetExhausted | DeadEnd)`, terminal

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlguard_core::{ConstraintValidator, GuardError, GuardSpec, Reason, ValidationOutcome};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::cache::ProbeCache;
use crate::record::{avg_per_attempt, ConstraintMode, RunRecord};
use crate::source::{Candidate, CandidateSource};
use crate::RuntimeError;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    EndMarker,
    StepBudgetExhausted,
    DeadEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStatus {
    Running,
    Halted(HaltReason),
}

/// Settings for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Step budget
    pub max_new_tokens: usize,

    /// Candidates requested per step; values below 1 act as 1
    pub top_k: usize,

    /// Validator recipe; `None` means unconstrained greedy decoding
    #[serde(default)]
    pub guard: Option<GuardSpec>,

    /// Cache probe outcomes by text when set
    #[serde(default)]
    pub probe_cache_capacity: Option<u64>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            top_k: 1,
            guard: None,
            probe_cache_capacity: None,
        }
    }
}

impl DecodeConfig {
    pub fn unconstrained(max_new_tokens: usize, top_k: usize) -> Self {
        Self {
            max_new_tokens,
            top_k,
            ..Default::default()
        }
    }

    pub fn guarded(guard: GuardSpec, max_new_tokens: usize, top_k: usize) -> Self {
        Self {
            max_new_tokens,
            top_k,
            guard: Some(guard),
            probe_cache_capacity: None,
        }
    }

    pub fn with_probe_cache(mut self, capacity: u64) -> Self {
        self.probe_cache_capacity = Some(capacity);
        self
    }

    pub fn effective_top_k(&self) -> usize {
        self.top_k.max(1)
    }

    pub fn mode(&self) -> ConstraintMode {
        if self.guard.is_some() {
            ConstraintMode::Guarded
        } else {
            ConstraintMode::None
        }
    }
}

/// Mutable bookkeeping of a run. Only the controller writes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeState {
    pub accepted_count: usize,
    pub rejected_count: usize,

    /// Probes by reason, accepted and rejected alike
    pub reject_reason_histogram: BTreeMap<Reason, usize>,

    pub dead_end: bool,

    /// Committed text, without the prompt
    pub output_text: String,

    pub status: DecodeStatus,

    /// Validator probes issued (guarded runs only)
    pub probe_attempts: usize,
}

impl Default for DecodeState {
    fn default() -> Self {
        Self {
            accepted_count: 0,
            rejected_count: 0,
            reject_reason_histogram: BTreeMap::new(),
            dead_end: false,
            output_text: String::new(),
            status: DecodeStatus::Running,
            probe_attempts: 0,
        }
    }
}

impl DecodeState {
    pub fn is_running(&self) -> bool {
        self.status == DecodeStatus::Running
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self.status {
            DecodeStatus::Running => None,
            DecodeStatus::Halted(reason) => Some(reason),
        }
    }

    fn halt(&mut self, reason: HaltReason) {
        if self.is_running() {
            self.dead_end = reason == HaltReason::DeadEnd;
            self.status = DecodeStatus::Halted(reason);
        }
    }

    fn commit(&mut self, text: &str) {
        self.output_text.push_str(text);
        self.accepted_count += 1;
    }

    fn count_reason(&mut self, reason: Reason) {
        *self.reject_reason_histogram.entry(reason).or_insert(0) += 1;
    }
}

/// Final state plus the record built from it.
#[derive(Debug, Clone)]
pub struct DecodeRun {
    pub state: DecodeState,
    pub record: RunRecord,
}

/// Runs guarded or unguarded decoding over one candidate source.
pub struct DecodeController<S: CandidateSource> {
    source: S,
    config: DecodeConfig,
    cache: Option<ProbeCache>,
}

impl<S: CandidateSource> DecodeController<S> {
    pub fn new(source: S, config: DecodeConfig) -> Self {
        let cache = config.probe_cache_capacity.map(ProbeCache::new);
        Self {
            source,
            config,
            cache,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Decode after `prompt` until a halt condition.
    ///
    /// Dead ends and an exhausted budget are normal halts and still yield a
    /// record. An adapter environment error aborts with
    /// [`RuntimeError::Adapter`] and no record.
    pub async fn run(&mut self, prompt: &str) -> Result<DecodeRun, RuntimeError> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let k = self.config.effective_top_k();
        let guard = self.config.guard.clone();

        // Surface configuration problems before the first inference call.
        if let Some(spec) = &guard {
            spec.build()?;
        }

        tracing::info!(
            model = self.source.model_id(),
            mode = ?self.config.mode(),
            top_k = k,
            max_new_tokens = self.config.max_new_tokens,
            "decode run started"
        );

        let mut state = DecodeState::default();

        for step in 0..self.config.max_new_tokens {
            let context = format!("{}{}", prompt, state.output_text);
            let mut candidates = self.source.candidates(&context, k).await?;
            candidates.truncate(k);

            let committed = match &guard {
                None => candidates.into_iter().next().map(|c| c.text),
                Some(spec) => self.search(spec, &mut state, candidates, step).await?,
            };

            let Some(text) = committed else {
                tracing::info!(step, "no candidate accepted, dead end");
                state.halt(HaltReason::DeadEnd);
                break;
            };

            state.commit(&text);
            if text == self.source.end_marker() {
                state.halt(HaltReason::EndMarker);
                break;
            }
        }

        state.halt(HaltReason::StepBudgetExhausted);

        let total_time_ms = timer.elapsed().as_secs_f64() * 1000.0;
        let record = self.build_record(prompt, &state, k, total_time_ms, started_at);

        tracing::info!(
            halt = ?record.halt_reason,
            accepted = record.accepted_tokens,
            rejected = record.rejected_tokens,
            total_ms = record.total_time_ms,
            "decode run finished"
        );

        Ok(DecodeRun { state, record })
    }

    /// Probe candidates in rank order; return the first accepted text.
    async fn search(
        &self,
        spec: &GuardSpec,
        state: &mut DecodeState,
        candidates: Vec<Candidate>,
        step: usize,
    ) -> Result<Option<String>, RuntimeError> {
        for candidate in candidates {
            let outcome = self.probe(spec, &state.output_text, &candidate.text).await?;
            state.probe_attempts += 1;
            state.count_reason(outcome.reason);

            if outcome.accepted {
                tracing::debug!(step, rank = candidate.rank, reason = %outcome.reason, "candidate accepted");
                return Ok(Some(candidate.text));
            }

            tracing::debug!(step, rank = candidate.rank, reason = %outcome.reason, "candidate rejected");
            state.rejected_count += 1;
        }

        Ok(None)
    }

    /// Judge `prefix + fragment` without touching any shared validator.
    async fn probe(
        &self,
        spec: &GuardSpec,
        prefix: &str,
        fragment: &str,
    ) -> Result<ValidationOutcome, RuntimeError> {
        let text = format!("{}{}", prefix, fragment);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&text).await {
                return Ok(hit);
            }
        }

        // Validators block (parsing, subprocess); run them off the async workers.
        let job = {
            let (spec, prefix, fragment) = (spec.clone(), prefix.to_string(), fragment.to_string());
            tokio::task::spawn_blocking(move || probe_fresh(&spec, &prefix, &fragment))
        };
        let result = job
            .await
            .unwrap_or_else(|e| Err(GuardError::Internal(format!("probe task failed: {e}"))));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if !e.is_fatal() => {
                // Fail closed: an ambiguous validator failure rejects.
                tracing::warn!(error = %e, "validator failed, rejecting candidate");
                return Ok(ValidationOutcome::reject(Reason::ParseError, text));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(cache) = &self.cache {
            cache.insert(text, outcome.clone()).await;
        }

        Ok(outcome)
    }

    fn build_record(
        &self,
        prompt: &str,
        state: &DecodeState,
        k: usize,
        total_time_ms: f64,
        started_at: chrono::DateTime<Utc>,
    ) -> RunRecord {
        let attempts = state.accepted_count + state.rejected_count;

        RunRecord {
            model: self.source.model_id().to_string(),
            device: self.source.device().to_string(),
            max_new_tokens: self.config.max_new_tokens,
            constraint: self.config.mode(),
            guard: self.config.guard.as_ref().map(GuardSpec::kind),
            top_k: k,
            accepted_tokens: state.accepted_count,
            rejected_tokens: state.rejected_count,
            dead_end: state.dead_end,
            halt_reason: state
                .halt_reason()
                .unwrap_or(HaltReason::StepBudgetExhausted),
            total_time_ms,
            avg_time_per_attempt_ms: avg_per_attempt(total_time_ms, attempts),
            reject_reason_histogram: state.reject_reason_histogram.clone(),
            prompt: prompt.to_string(),
            output_text: format!("{}{}", prompt, state.output_text),
            started_at,
        }
    }
}

/// Fresh validator, replay `prefix`, then step `fragment`.
fn probe_fresh(
    spec: &GuardSpec,
    prefix: &str,
    fragment: &str,
) -> Result<ValidationOutcome, GuardError> {
    let mut validator = spec.build()?;
    validator.reset();
    if !prefix.is_empty() {
        validator.step(prefix)?;
    }
    validator.step(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use sqlguard_core::{AdapterConfig, GuardConfig};

    fn grammar() -> GuardSpec {
        GuardSpec::Grammar(GuardConfig::default())
    }

    #[tokio::test]
    async fn test_unconstrained_commits_rank_zero() {
        let source = ScriptedSource::from_rows(&[&["SELECT ", "x"], &["FROM ;", "y"], &["</s>"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::unconstrained(10, 2));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.state.output_text, "SELECT FROM ;</s>");
        assert_eq!(run.state.accepted_count, 3);
        assert_eq!(run.state.rejected_count, 0);
        assert_eq!(run.state.halt_reason(), Some(HaltReason::EndMarker));
        assert!(run.state.reject_reason_histogram.is_empty());
    }

    #[tokio::test]
    async fn test_guard_skips_rejected_candidate() {
        let source = ScriptedSource::from_rows(&[
            &["SELECT "],
            &["FROM ;", "* "],
            &["FROM ", "x"],
            &["author;"],
        ]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(grammar(), 4, 2));

        let run = controller.run("-- q\n").await.unwrap();
        assert_eq!(run.state.output_text, "SELECT * FROM author;");
        assert_eq!(run.state.accepted_count, 4);
        assert_eq!(run.state.rejected_count, 1);
        assert_eq!(run.state.reject_reason_histogram[&Reason::ParseError], 1);
        assert_eq!(run.state.halt_reason(), Some(HaltReason::StepBudgetExhausted));
        assert!(!run.state.dead_end);
        assert_eq!(run.record.output_text, "-- q\nSELECT * FROM author;");
    }

    #[tokio::test]
    async fn test_dead_end_when_all_candidates_rejected() {
        let source = ScriptedSource::from_rows(&[&["SELECT FROM ;", "SELECT WHERE;"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(grammar(), 5, 2));

        let run = controller.run("").await.unwrap();
        assert!(run.state.dead_end);
        assert_eq!(run.state.accepted_count, 0);
        assert_eq!(run.state.rejected_count, 2);
        assert_eq!(run.record.halt_reason, HaltReason::DeadEnd);
        assert!(run.record.dead_end);
    }

    #[tokio::test]
    async fn test_empty_candidate_list_is_dead_end() {
        let source = ScriptedSource::from_rows(&[&[]]);
        let mut controller = DecodeController::new(source, DecodeConfig::unconstrained(3, 1));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.state.halt_reason(), Some(HaltReason::DeadEnd));
    }

    #[tokio::test]
    async fn test_zero_budget_halts_immediately() {
        let source = ScriptedSource::from_rows(&[&["SELECT "]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(grammar(), 0, 1));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.state.halt_reason(), Some(HaltReason::StepBudgetExhausted));
        assert_eq!(controller.source().steps_served(), 0);
    }

    #[tokio::test]
    async fn test_top_k_zero_acts_as_one() {
        let source = ScriptedSource::from_rows(&[&["SELECT ", "other"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(grammar(), 1, 0));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.record.top_k, 1);
        assert_eq!(run.state.probe_attempts, 1);
    }

    #[tokio::test]
    async fn test_end_marker_committed_halts_run() {
        let source = ScriptedSource::from_rows(&[&["SELECT 1;"], &["</s>", " "]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(grammar(), 4, 2));

        let run = controller.run("").await.unwrap();
        // Unterminated tail reads as truncation, so the marker passes.
        assert_eq!(run.state.output_text, "SELECT 1;</s>");
        assert_eq!(run.state.halt_reason(), Some(HaltReason::EndMarker));
    }

    #[tokio::test]
    async fn test_end_marker_is_probed_like_any_fragment() {
        let strict = GuardSpec::Grammar(GuardConfig::default().strict());
        let source = ScriptedSource::from_rows(&[&["SELECT 1;"], &["</s>", " "]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(strict, 4, 2));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.state.output_text, "SELECT 1; ");
        // Script exhausted: only the marker is offered, and it is rejected.
        assert!(run.state.dead_end);
        assert_eq!(run.state.rejected_count, 2);
    }

    #[tokio::test]
    async fn test_adapter_environment_error_aborts() {
        let spec = GuardSpec::External(AdapterConfig::in_process("/definitely/not/here"));
        let source = ScriptedSource::from_rows(&[&["SELECT * FROM t"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(spec, 3, 1));

        let result = controller.run("").await;
        assert!(matches!(result, Err(RuntimeError::Adapter(_))));
    }

    #[tokio::test]
    async fn test_adapter_rejections_use_generic_reason() {
        let root = tempfile::tempdir().unwrap();
        let spec = GuardSpec::External(AdapterConfig::in_process(root.path()));
        let source = ScriptedSource::from_rows(&[&["SELECT ", "SELECT a FROM t"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(spec, 1, 2));

        let run = controller.run("").await.unwrap();
        assert_eq!(run.state.output_text, "SELECT a FROM t");
        assert_eq!(run.state.reject_reason_histogram[&Reason::Rejected], 1);
        assert_eq!(run.record.guard, Some(sqlguard_core::ValidatorKind::External));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_internal_validator_failure_fails_closed() {
        let root = tempfile::tempdir().unwrap();
        let spec = GuardSpec::External(AdapterConfig::subprocess(
            root.path(),
            "sh",
            vec!["-c".to_string(), "exit 42".to_string(), "sh".to_string()],
        ));
        let source = ScriptedSource::from_rows(&[&["SELECT * FROM t"]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(spec, 3, 1));

        let run = controller.run("").await.unwrap();
        assert!(run.state.dead_end);
        assert_eq!(run.state.reject_reason_histogram[&Reason::ParseError], 1);
    }

    #[tokio::test]
    async fn test_unknown_dialect_fails_before_decoding() {
        let spec = GuardSpec::Grammar(GuardConfig::with_dialect("esperanto"));
        let source = ScriptedSource::from_rows(&[&["SELECT "]]);
        let mut controller = DecodeController::new(source, DecodeConfig::guarded(spec, 3, 1));

        let result = controller.run("").await;
        assert!(matches!(result, Err(RuntimeError::Guard(_))));
        assert_eq!(controller.source().steps_served(), 0);
    }

    #[tokio::test]
    async fn test_probe_cache_keeps_accounting() {
        let rows: &[&[&str]] = &[&["SELECT ", "x"], &["FROM ;", "1"], &[";"]];
        let plain = DecodeController::new(
            ScriptedSource::from_rows(rows),
            DecodeConfig::guarded(grammar(), 3, 2),
        )
        .run("")
        .await
        .unwrap();

        let cached = DecodeController::new(
            ScriptedSource::from_rows(rows),
            DecodeConfig::guarded(grammar(), 3, 2).with_probe_cache(64),
        )
        .run("")
        .await
        .unwrap();

        assert_eq!(plain.state, cached.state);
    }
}
