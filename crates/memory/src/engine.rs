//! Memory engine: extraction, selection, and decay of long-term facts.
//!
//! Extraction and selection call capability-tagged models through the
//! [`ModelPool`]; both tolerate model failure (extraction skips, selection
//! falls back to top-scoring). Decay is pure arithmetic:
//! `score = 0.4·recency + 0.3·frequency + 0.3·engagement`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cortex_domain::error::{Error, Result};
use cortex_domain::memory::{Memory, MemoryCategory};
use cortex_domain::tool::{Message, Role};
use cortex_providers::client::{ChatBackend, ChatRequest, ResponseFormat};
use cortex_providers::pool::ModelPool;
use cortex_stores::MemoryStore;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::EncryptionService;
use crate::hash;

const RECENCY_DECAY_PER_DAY: f64 = 0.05;
const FREQUENCY_SATURATION: f64 = 20.0;
const WEIGHT_RECENCY: f64 = 0.4;
const WEIGHT_FREQUENCY: f64 = 0.3;
const WEIGHT_ENGAGEMENT: f64 = 0.3;

const MODEL_ATTEMPTS: usize = 3;
const SELECT_LIMIT: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decay score at `now`. Recency anchors on the last access, or creation
/// when the memory was never accessed.
pub fn decay_score(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let anchor = memory.last_accessed_at.unwrap_or(memory.created_at);
    let days = (now - anchor).num_seconds().max(0) as f64 / 86_400.0;
    let recency = (-RECENCY_DECAY_PER_DAY * days).exp();
    let frequency = (memory.access_count as f64 / FREQUENCY_SATURATION).min(1.0);
    let engagement = memory.source_engagement as f64;
    WEIGHT_RECENCY * recency + WEIGHT_FREQUENCY * frequency + WEIGHT_ENGAGEMENT * engagement
}

/// Engagement of a source conversation, in [0, 1]: turn ratio, assistant
/// response length, and recency of the last activity.
pub fn compute_engagement(
    user_turns: usize,
    total_turns: usize,
    assistant_chars: usize,
    days_since_activity: f64,
) -> f32 {
    let turn_ratio = if total_turns == 0 {
        0.0
    } else {
        user_turns as f64 / total_turns as f64
    };
    let length = (assistant_chars as f64 / 2_000.0).min(1.0);
    let recency = (-0.1 * days_since_activity.max(0.0)).exp();
    (0.4 * turn_ratio + 0.3 * length + 0.3 * recency) as f32
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryEngine {
    store: Arc<MemoryStore>,
    backend: Arc<dyn ChatBackend>,
    pool: Arc<ModelPool>,
    cipher: Arc<dyn EncryptionService>,
    /// At or below this many active memories, selection returns all.
    pass_through: usize,
    archive_threshold: f64,
    utility_timeout: Duration,
}

#[derive(Deserialize)]
struct ExtractedMemory {
    content: String,
    category: MemoryCategory,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ExtractionOutput {
    #[serde(default)]
    memories: Vec<ExtractedMemory>,
}

#[derive(Deserialize)]
struct SelectionOutput {
    #[serde(default)]
    selected_ids: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

impl MemoryEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        backend: Arc<dyn ChatBackend>,
        pool: Arc<ModelPool>,
        cipher: Arc<dyn EncryptionService>,
        pass_through: usize,
        archive_threshold: f64,
        utility_timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            pool,
            cipher,
            pass_through,
            archive_threshold,
            utility_timeout,
        }
    }

    /// Structured call with failover: up to [`MODEL_ATTEMPTS`] candidates
    /// from the given capability tag.
    async fn call_structured(
        &self,
        tag: &str,
        messages: Vec<Message>,
        schema_name: &str,
        schema: Value,
    ) -> Result<Value> {
        let mut last_err: Option<Error> = None;
        for _ in 0..MODEL_ATTEMPTS {
            let Some(candidate) = self.pool.get_next(tag) else {
                return Err(Error::Config(format!("no models tagged '{tag}'")));
            };
            let mut req = ChatRequest::new(&candidate.provider_id, &candidate.model);
            req.messages = messages.clone();
            req.temperature = Some(0.0);
            req.response_format = Some(ResponseFormat {
                name: schema_name.to_owned(),
                schema: schema.clone(),
            });

            match self.backend.chat(&req, self.utility_timeout).await {
                Ok(resp) => match cortex_providers::client::parse_json_output(&resp.content) {
                    Ok(value) => {
                        self.pool.record_success(tag, &candidate);
                        return Ok(value);
                    }
                    Err(e) => {
                        self.pool
                            .record_failure(tag, &candidate, &e.to_string(), None);
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    let status = if matches!(e, Error::LlmQuota { .. }) {
                        Some(429)
                    } else {
                        None
                    };
                    self.pool
                        .record_failure(tag, &candidate, &e.to_string(), status);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("structured call failed".into())))
    }

    // ── Extract ─────────────────────────────────────────────────────

    /// Extract durable facts from the closing turns of a conversation.
    /// Duplicate facts (by normalized hash) are skipped. Returns the
    /// number of memories inserted.
    pub async fn extract(
        &self,
        user_id: &str,
        closing_turns: &[Message],
        engagement: f32,
    ) -> Result<usize> {
        if closing_turns.is_empty() {
            return Ok(0);
        }
        let transcript = closing_turns
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| {
                let who = if m.role == Role::User { "User" } else { "Assistant" };
                format!("{who}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system = "Extract durable facts about the user from this conversation: \
                      personal details, preferences, standing context, plain facts, and \
                      explicit instructions. Only include facts worth remembering across \
                      conversations. Return an empty list when nothing qualifies.";
        let messages = vec![Message::system(system), Message::user(transcript)];

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "memories": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": {"type": "string"},
                            "category": {
                                "type": "string",
                                "enum": ["personal_info", "preferences", "context", "fact", "instruction"],
                            },
                            "tags": {"type": "array", "items": {"type": "string"}},
                        },
                        "required": ["content", "category"],
                    },
                },
            },
            "required": ["memories"],
        });

        let value = self
            .call_structured("extractor", messages, "memory_extraction", schema)
            .await?;
        let output: ExtractionOutput = serde_json::from_value(value)?;

        let mut inserted = 0usize;
        for extracted in output.memories {
            if extracted.content.trim().is_empty() {
                continue;
            }
            let content_hash = hash::content_hash(&extracted.content);
            let encrypted = self.cipher.encrypt(user_id, &extracted.content)?;
            let mut memory = Memory::new(
                user_id,
                encrypted,
                extracted.category,
                content_hash,
                engagement,
            );
            memory.tags = extracted.tags;
            if self.store.insert_if_absent(memory)? {
                inserted += 1;
            }
        }
        tracing::debug!(user_id, inserted, "memory extraction finished");
        Ok(inserted)
    }

    // ── Select ──────────────────────────────────────────────────────

    /// Pick the memories most relevant to `query`. Small working sets pass
    /// through untouched; larger ones go through the selector model, with
    /// a top-scoring fallback when the model fails. Every returned memory
    /// gets an access bump.
    pub async fn select(&self, user_id: &str, query: &str) -> Result<Vec<Memory>> {
        let active = self.store.active_for_user(user_id);
        if active.len() <= self.pass_through {
            return self.finish_selection(user_id, active);
        }

        match self.select_via_model(user_id, query, &active).await {
            Ok(selected) if !selected.is_empty() => self.finish_selection(user_id, selected),
            Ok(_) | Err(_) => {
                tracing::warn!(user_id, "memory selection fell back to top-scoring");
                let now = Utc::now();
                let mut scored = active;
                scored.sort_by(|a, b| {
                    decay_score(b, now)
                        .partial_cmp(&decay_score(a, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(SELECT_LIMIT);
                self.finish_selection(user_id, scored)
            }
        }
    }

    async fn select_via_model(
        &self,
        user_id: &str,
        query: &str,
        active: &[Memory],
    ) -> Result<Vec<Memory>> {
        let mut listing = String::new();
        for m in active {
            let content = self.cipher.decrypt(user_id, &m.encrypted_content)?;
            listing.push_str(&format!("{}: {}\n", m.id, content));
        }
        let system = format!(
            "Given the user's message and their stored memories, select up to \
             {SELECT_LIMIT} memory ids most relevant to the message. Explain briefly."
        );
        let messages = vec![
            Message::system(system),
            Message::user(format!("Message: {query}\n\nMemories:\n{listing}")),
        ];
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "selected_ids": {"type": "array", "items": {"type": "string"}},
                "reasoning": {"type": "string"},
            },
            "required": ["selected_ids", "reasoning"],
        });

        let value = self
            .call_structured("selector", messages, "memory_selection", schema)
            .await?;
        let output: SelectionOutput = serde_json::from_value(value)?;

        let mut selected = Vec::new();
        for id_str in output.selected_ids.iter().take(SELECT_LIMIT) {
            let Ok(id) = id_str.parse::<Uuid>() else {
                continue;
            };
            if let Some(m) = active.iter().find(|m| m.id == id) {
                selected.push(m.clone());
            }
        }
        Ok(selected)
    }

    /// [`Self::select`], decrypted for prompt assembly.
    pub async fn select_contents(&self, user_id: &str, query: &str) -> Result<Vec<String>> {
        let memories = self.select(user_id, query).await?;
        memories
            .iter()
            .map(|m| self.cipher.decrypt(user_id, &m.encrypted_content))
            .collect()
    }

    fn finish_selection(&self, user_id: &str, memories: Vec<Memory>) -> Result<Vec<Memory>> {
        for m in &memories {
            self.store.update_access(user_id, &m.id)?;
        }
        Ok(memories)
    }

    // ── Decay ───────────────────────────────────────────────────────

    /// Archive every active memory scoring under the threshold at `now`.
    /// Returns the archived ids.
    pub fn decay_pass(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut archived = Vec::new();
        for memory in self.store.active_for_user(user_id) {
            if decay_score(&memory, now) < self.archive_threshold {
                self.store.archive(user_id, &memory.id)?;
                archived.push(memory.id);
            }
        }
        if !archived.is_empty() {
            tracing::info!(user_id, count = archived.len(), "archived decayed memories");
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextCipher;
    use cortex_domain::config::ModelConfig;
    use cortex_providers::client::ChatResponse;
    use cortex_providers::health::HealthTracker;
    use parking_lot::Mutex;

    struct FakeBackend {
        responses: Mutex<Vec<Result<String>>>,
    }

    impl FakeBackend {
        fn with(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for FakeBackend {
        async fn chat(&self, _req: &ChatRequest, _timeout: Duration) -> Result<ChatResponse> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(Error::Other("fake backend exhausted".into()));
            }
            responses.remove(0).map(|content| ChatResponse {
                content,
                tool_calls: vec![],
            })
        }
    }

    fn pool() -> Arc<ModelPool> {
        Arc::new(ModelPool::from_config(
            &[ModelConfig {
                provider_id: "gw".into(),
                model: "util".into(),
                tags: vec!["extractor".into(), "selector".into()],
                structured_latency_ms: 100,
            }],
            Arc::new(HealthTracker::default()),
        ))
    }

    fn engine(backend: Arc<FakeBackend>, store: Arc<MemoryStore>) -> MemoryEngine {
        MemoryEngine::new(
            store,
            backend,
            pool(),
            Arc::new(PlaintextCipher),
            3,
            0.15,
            Duration::from_secs(30),
        )
    }

    fn seeded_memory(user: &str, content: &str, engagement: f32) -> Memory {
        Memory::new(
            user,
            content,
            MemoryCategory::Fact,
            hash::content_hash(content),
            engagement,
        )
    }

    #[tokio::test]
    async fn extract_inserts_and_dedupes() {
        let store = Arc::new(MemoryStore::in_memory());
        let response = serde_json::json!({
            "memories": [
                {"content": "Prefers dark roast coffee", "category": "preferences", "tags": ["coffee"]},
                {"content": "prefers DARK ROAST coffee!", "category": "preferences", "tags": []},
            ]
        })
        .to_string();
        let backend = FakeBackend::with(vec![Ok(response)]);
        let eng = engine(backend, store.clone());

        let turns = vec![
            Message::user("I only drink dark roast"),
            Message::assistant("Noted."),
        ];
        let inserted = eng.extract("u1", &turns, 0.8).await.unwrap();
        // The second extraction normalizes to the same hash.
        assert_eq!(inserted, 1);
        assert_eq!(store.active_for_user("u1").len(), 1);
    }

    #[tokio::test]
    async fn extract_empty_turns_is_noop() {
        let store = Arc::new(MemoryStore::in_memory());
        let backend = FakeBackend::with(vec![]);
        let eng = engine(backend, store);
        assert_eq!(eng.extract("u1", &[], 0.5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn select_passes_through_small_sets() {
        let store = Arc::new(MemoryStore::in_memory());
        for i in 0..3 {
            store
                .insert_if_absent(seeded_memory("u1", &format!("fact {i}"), 0.5))
                .unwrap();
        }
        // Backend would fail, but pass-through never calls it.
        let backend = FakeBackend::with(vec![]);
        let eng = engine(backend, store.clone());
        let selected = eng.select("u1", "anything").await.unwrap();
        assert_eq!(selected.len(), 3);
        // Access bumped on every return.
        for m in store.active_for_user("u1") {
            assert_eq!(m.access_count, 1);
        }
    }

    #[tokio::test]
    async fn select_uses_model_for_large_sets() {
        let store = Arc::new(MemoryStore::in_memory());
        let mut ids = Vec::new();
        for i in 0..6 {
            let m = seeded_memory("u1", &format!("fact number {i}"), 0.5);
            ids.push(m.id);
            store.insert_if_absent(m).unwrap();
        }
        let response = serde_json::json!({
            "selected_ids": [ids[0].to_string(), ids[4].to_string()],
            "reasoning": "closest match",
        })
        .to_string();
        let backend = FakeBackend::with(vec![Ok(response)]);
        let eng = engine(backend, store);
        let selected = eng.select("u1", "which facts?").await.unwrap();
        let got: Vec<Uuid> = selected.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[0], ids[4]]);
    }

    #[tokio::test]
    async fn select_falls_back_on_model_failure() {
        let store = Arc::new(MemoryStore::in_memory());
        for i in 0..8 {
            store
                .insert_if_absent(seeded_memory("u1", &format!("fact {i}"), 0.5))
                .unwrap();
        }
        // All three attempts fail.
        let backend = FakeBackend::with(vec![
            Err(Error::Other("down".into())),
            Err(Error::Other("down".into())),
            Err(Error::Other("down".into())),
        ]);
        let eng = engine(backend, store);
        let selected = eng.select("u1", "anything").await.unwrap();
        assert_eq!(selected.len(), SELECT_LIMIT);
    }

    #[test]
    fn decay_score_weights_sum_to_one() {
        assert!((WEIGHT_RECENCY + WEIGHT_FREQUENCY + WEIGHT_ENGAGEMENT - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn decay_lifecycle_with_engagement_stays_active() {
        // Created day 0, engagement 0.85, accessed day 7 and day 30.
        let day0 = Utc::now();
        let mut m = seeded_memory("u1", "important fact", 0.85);
        m.created_at = day0;
        m.access_count = 2;
        m.last_accessed_at = Some(day0 + chrono::Duration::days(30));

        let s30 = decay_score(&m, day0 + chrono::Duration::days(30));
        let s60 = decay_score(&m, day0 + chrono::Duration::days(60));
        let s90 = decay_score(&m, day0 + chrono::Duration::days(90));
        assert!(s30 > s60 && s60 > s90);
        assert!(s90 >= 0.15, "engaged memory must stay active, got {s90}");
    }

    #[test]
    fn decay_pass_archives_below_threshold() {
        let store = Arc::new(MemoryStore::in_memory());
        let backend = FakeBackend::with(vec![]);

        // Stale, never accessed, low engagement: should fall under 0.15.
        let mut stale = seeded_memory("u1", "stale trivia", 0.0);
        stale.created_at = Utc::now() - chrono::Duration::days(120);
        let stale_id = stale.id;
        store.insert_if_absent(stale).unwrap();

        // High engagement keeps this one alive at the same age.
        let mut engaged = seeded_memory("u1", "engaged fact", 0.9);
        engaged.created_at = Utc::now() - chrono::Duration::days(120);
        store.insert_if_absent(engaged).unwrap();

        let eng = engine(backend, store.clone());
        let archived = eng.decay_pass("u1", Utc::now()).unwrap();
        assert_eq!(archived, vec![stale_id]);
        assert_eq!(store.active_for_user("u1").len(), 1);
    }

    #[test]
    fn engagement_bounds() {
        let high = compute_engagement(5, 10, 4_000, 0.0);
        let low = compute_engagement(0, 10, 0, 365.0);
        assert!(high > 0.7 && high <= 1.0);
        assert!(low >= 0.0 && low < 0.05);
    }
}
