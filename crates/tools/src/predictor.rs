//! Tool predictor: narrows the full tool catalog to a minimal subset for
//! one chat turn.
//!
//! The predicted set is unioned with a per-conversation cache
//! (`chat:tools:<conversation>`) so follow-up turns keep the tools already
//! in play even when the model stops re-asking for them; topic shifts add
//! new names on top. Tools actually invoked during a turn join the cache
//! through [`ToolPredictor::add_tool_to_cache`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cortex_cache::SharedCache;
use cortex_domain::error::{Error, Result};
use cortex_domain::tool::{Message, Role, ToolDefinition};
use cortex_providers::client::{ChatBackend, ChatRequest, ResponseFormat};
use cortex_providers::pool::ModelPool;
use serde::Deserialize;

const CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const CACHE_READ_BUDGET: Duration = Duration::from_millis(500);
const MODEL_ATTEMPTS: usize = 3;
const HISTORY_WINDOW: usize = 6;

fn cache_key(conversation_id: &str) -> String {
    format!("chat:tools:{conversation_id}")
}

#[derive(Deserialize)]
struct PredictionOutput {
    #[serde(default)]
    selected_tools: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

pub struct ToolPredictor {
    backend: Arc<dyn ChatBackend>,
    pool: Arc<ModelPool>,
    cache: Arc<dyn SharedCache>,
    /// System-level model override, applied when the user has none.
    system_model_override: Option<String>,
    utility_timeout: Duration,
}

impl ToolPredictor {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        pool: Arc<ModelPool>,
        cache: Arc<dyn SharedCache>,
        system_model_override: Option<String>,
        utility_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            pool,
            cache,
            system_model_override,
            utility_timeout,
        }
    }

    /// Predict the tool subset for this turn and return `available`
    /// filtered to it. Errors only when the predictor failed AND the
    /// conversation cache was empty; any cached names keep the turn alive.
    pub async fn predict(
        &self,
        conversation_id: &str,
        user_message: &str,
        available: &[ToolDefinition],
        history: &[Message],
        user_model_preference: Option<&str>,
    ) -> Result<Vec<ToolDefinition>> {
        if available.is_empty() {
            return Ok(Vec::new());
        }

        // 1. Cached set, within a hard read budget. A slow or failing
        //    cache degrades to an empty set.
        let key = cache_key(conversation_id);
        let cached: BTreeSet<String> =
            match tokio::time::timeout(CACHE_READ_BUDGET, self.cache.smembers(&key)).await {
                Ok(Ok(members)) => members.into_iter().collect(),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "tool cache read failed");
                    BTreeSet::new()
                }
                Err(_) => {
                    tracing::warn!("tool cache read exceeded budget");
                    BTreeSet::new()
                }
            };

        // 2–4. Model prediction with failover.
        let (predicted, predictor_err) = match self
            .predict_via_model(user_message, available, history, user_model_preference)
            .await
        {
            Ok(names) => (names, None),
            Err(e) => {
                tracing::warn!(error = %e, "tool prediction failed, relying on cache");
                (BTreeSet::new(), Some(e))
            }
        };

        // 5. Union; surface an error only when there is nothing at all.
        let final_set: BTreeSet<String> = predicted.union(&cached).cloned().collect();
        if final_set.is_empty() {
            if let Some(e) = predictor_err {
                return Err(e);
            }
            return Ok(Vec::new());
        }
        let members: Vec<String> = final_set.iter().cloned().collect();
        if let Err(e) = self.cache.sadd(&key, &members, Some(CACHE_TTL)).await {
            tracing::warn!(error = %e, "tool cache write failed");
        }

        // 6. Filter the catalog.
        Ok(available
            .iter()
            .filter(|d| final_set.contains(&d.name))
            .cloned()
            .collect())
    }

    /// Record that a tool was actually invoked this turn; it joins the
    /// union for subsequent turns on the same conversation.
    pub async fn add_tool_to_cache(&self, conversation_id: &str, tool_name: &str) {
        let key = cache_key(conversation_id);
        if let Err(e) = self
            .cache
            .sadd(&key, &[tool_name.to_owned()], Some(CACHE_TTL))
            .await
        {
            tracing::warn!(error = %e, tool_name, "failed to add tool to cache");
        }
    }

    async fn predict_via_model(
        &self,
        user_message: &str,
        available: &[ToolDefinition],
        history: &[Message],
        user_model_preference: Option<&str>,
    ) -> Result<BTreeSet<String>> {
        let catalog = available
            .iter()
            .enumerate()
            .map(|(i, d)| format!("{}. {} — {}", i + 1, d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let mut messages = vec![Message::system(
            "Select the minimal set of tools the assistant could need to answer \
             the user's next message. Prefer fewer tools; select none when the \
             message needs no tool. Use exact tool names from the list.",
        )];
        for m in history
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .rev()
            .take(HISTORY_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            messages.push(Message {
                role: m.role,
                content: m.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.push(Message::user(format!(
            "Message: {user_message}\n\nAvailable tools:\n{catalog}"
        )));

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "selected_tools": {"type": "array", "items": {"type": "string"}},
                "reasoning": {"type": "string"},
            },
            "required": ["selected_tools", "reasoning"],
        });

        let mut last_err: Option<Error> = None;
        for attempt in 0..MODEL_ATTEMPTS {
            // Preference order: user choice, then system override, then
            // the router pool. After a failed first attempt, always fail
            // over to the pool.
            let explicit = if attempt == 0 {
                user_model_preference
                    .map(str::to_owned)
                    .or_else(|| self.system_model_override.clone())
            } else {
                None
            };
            let (provider_id, model, pooled) = match explicit {
                Some(spec) => match spec.split_once('/') {
                    Some((p, m)) => (p.to_owned(), m.to_owned(), None),
                    None => ("gateway".to_owned(), spec, None),
                },
                None => {
                    let Some(candidate) = self.pool.get_next("router") else {
                        return Err(Error::Config("no models tagged 'router'".into()));
                    };
                    (
                        candidate.provider_id.clone(),
                        candidate.model.clone(),
                        Some(candidate),
                    )
                }
            };

            let mut req = ChatRequest::new(&provider_id, &model);
            req.messages = messages.clone();
            req.temperature = Some(0.0);
            req.response_format = Some(ResponseFormat {
                name: "tool_selection".into(),
                schema: schema.clone(),
            });

            match self.backend.chat(&req, self.utility_timeout).await {
                Ok(resp) => match cortex_providers::client::parse_json_output(&resp.content)
                    .and_then(|v| {
                        serde_json::from_value::<PredictionOutput>(v).map_err(Error::Json)
                    }) {
                    Ok(output) => {
                        if let Some(c) = &pooled {
                            self.pool.record_success("router", c);
                        }
                        return Ok(output.selected_tools.into_iter().collect());
                    }
                    Err(e) => {
                        if let Some(c) = &pooled {
                            self.pool.record_failure("router", c, &e.to_string(), None);
                        }
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    if let Some(c) = &pooled {
                        let status = matches!(e, Error::LlmQuota { .. }).then_some(429);
                        self.pool.record_failure("router", c, &e.to_string(), status);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("tool prediction failed".into())))
    }
}
