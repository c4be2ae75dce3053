//! Probe outcome cache.
//!
//! Validators are deterministic for a given text, so a probe of
//! `prefix + candidate` can reuse an earlier verdict for the same text.
//! Scoped to one controller, never shared across runs.

use moka::future::Cache;
use sqlguard_core::ValidationOutcome;

/// Outcome cache keyed by the full probed text.
pub struct ProbeCache {
    cache: Cache<String, ValidationOutcome>,
}

impl ProbeCache {
    /// Create a cache holding at most `max_entries` outcomes.
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).build();
        Self { cache }
    }

    /// Get the cached outcome for a probed text.
    pub async fn get(&self, text: &str) -> Option<ValidationOutcome> {
        self.cache.get(text).await
    }

    /// Store the outcome for a probed text.
    pub async fn insert(&self, text: String, outcome: ValidationOutcome) {
        self.cache.insert(text, outcome).await;
    }
}
