//! Capability-tagged model selection.
//!
//! Candidates for each tag are ordered by observed structured-output
//! latency. `get_next` round-robins over healthy candidates; when all are
//! unhealthy, it returns the fastest as a last resort so callers always
//! get something to try.

use std::collections::HashMap;
use std::sync::Arc;

use cortex_domain::config::ModelConfig;
use parking_lot::Mutex;

use crate::health::HealthTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub provider_id: String,
    pub model: String,
    pub latency_ms: u64,
}

pub struct ModelPool {
    /// Tag -> candidates, sorted by latency ascending.
    tags: HashMap<String, Vec<ModelCandidate>>,
    cursors: Mutex<HashMap<String, usize>>,
    health: Arc<HealthTracker>,
}

impl ModelPool {
    pub fn from_config(models: &[ModelConfig], health: Arc<HealthTracker>) -> Self {
        let mut tags: HashMap<String, Vec<ModelCandidate>> = HashMap::new();
        for m in models {
            for tag in &m.tags {
                tags.entry(tag.clone()).or_default().push(ModelCandidate {
                    provider_id: m.provider_id.clone(),
                    model: m.model.clone(),
                    latency_ms: m.structured_latency_ms,
                });
            }
        }
        for candidates in tags.values_mut() {
            candidates.sort_by_key(|c| c.latency_ms);
        }
        Self {
            tags,
            cursors: Mutex::new(HashMap::new()),
            health,
        }
    }

    /// Next candidate for a capability tag. Round-robin over healthy
    /// candidates; fastest overall when none are healthy; `None` only when
    /// the tag has no candidates at all.
    pub fn get_next(&self, tag: &str) -> Option<ModelCandidate> {
        let candidates = self.tags.get(tag)?;
        if candidates.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(tag.to_owned()).or_insert(0);
        for _ in 0..candidates.len() {
            let candidate = &candidates[*cursor % candidates.len()];
            *cursor = (*cursor + 1) % candidates.len();
            if self
                .health
                .is_provider_healthy(tag, &candidate.provider_id, &candidate.model)
            {
                return Some(candidate.clone());
            }
        }

        // All unhealthy: fall back to the fastest.
        tracing::warn!(tag, "all candidates unhealthy, returning fastest as last resort");
        Some(candidates[0].clone())
    }

    /// All candidates for a tag (latency order). Used for bounded retries.
    pub fn candidates(&self, tag: &str) -> &[ModelCandidate] {
        self.tags.get(tag).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn record_success(&self, tag: &str, candidate: &ModelCandidate) {
        self.health
            .mark_healthy(tag, &candidate.provider_id, &candidate.model);
    }

    pub fn record_failure(
        &self,
        tag: &str,
        candidate: &ModelCandidate,
        reason: &str,
        status: Option<u16>,
    ) {
        self.health
            .mark_unhealthy(tag, &candidate.provider_id, &candidate.model, reason, status);
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }
}
