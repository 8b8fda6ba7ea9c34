//! Intent classification.
//!
//! One structured call against the `router` capability decides how a
//! message is handled: answer about running work (`status`), answer
//! directly (`quick`), or plan one or more daemons. The classifier is
//! biased toward planning work when tools could help.

use std::sync::Arc;
use std::time::Duration;

use cortex_domain::config::TemplateConfig;
use cortex_domain::daemon::{Daemon, DaemonPlan};
use cortex_domain::error::{Error, Result};
use cortex_domain::task::TaskMode;
use cortex_domain::tool::Message;
use cortex_providers::client::{ChatBackend, ChatRequest, ResponseFormat};
use cortex_providers::pool::ModelPool;
use serde::Deserialize;

use crate::context;

const MODEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct Classification {
    pub mode: TaskMode,
    #[serde(default)]
    pub daemons: Vec<DaemonPlan>,
}

pub struct Classifier {
    backend: Arc<dyn ChatBackend>,
    pool: Arc<ModelPool>,
    utility_timeout: Duration,
}

impl Classifier {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        pool: Arc<ModelPool>,
        utility_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            pool,
            utility_timeout,
        }
    }

    pub async fn classify(
        &self,
        user_message: &str,
        active_daemons: &[Daemon],
        templates: &[TemplateConfig],
    ) -> Result<Classification> {
        let prompt =
            context::build_classification_prompt(user_message, active_daemons, templates);
        let schema = classification_schema();

        let mut last_err: Option<Error> = None;
        for _ in 0..MODEL_ATTEMPTS {
            let Some(candidate) = self.pool.get_next("router") else {
                return Err(Error::Config("no models tagged 'router'".into()));
            };
            let mut req = ChatRequest::new(&candidate.provider_id, &candidate.model);
            req.messages = vec![Message::system(prompt.clone())];
            req.temperature = Some(0.0);
            req.response_format = Some(ResponseFormat {
                name: "classification".into(),
                schema: schema.clone(),
            });

            match self.backend.chat(&req, self.utility_timeout).await {
                Ok(resp) => {
                    match cortex_providers::client::parse_json_output(&resp.content)
                        .and_then(|v| {
                            serde_json::from_value::<Classification>(v).map_err(Error::Json)
                        })
                        .and_then(validate)
                    {
                        Ok(mut classification) => {
                            self.pool.record_success("router", &candidate);
                            apply_templates(&mut classification.daemons, templates);
                            return Ok(classification);
                        }
                        Err(e) => {
                            self.pool
                                .record_failure("router", &candidate, &e.to_string(), None);
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => {
                    let status = matches!(e, Error::LlmQuota { .. }).then_some(429);
                    self.pool
                        .record_failure("router", &candidate, &e.to_string(), status);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("classification failed".into())))
    }
}

/// Consistency checks on the model's plan before the orchestrator acts
/// on it.
fn validate(classification: Classification) -> Result<Classification> {
    match classification.mode {
        TaskMode::Daemon | TaskMode::MultiDaemon => {
            if classification.daemons.is_empty() {
                return Err(Error::Validation(
                    "daemon mode requires at least one planned daemon".into(),
                ));
            }
            DaemonPlan::validate_plan(&classification.daemons)?;
        }
        _ => {
            if !classification.daemons.is_empty() {
                return Err(Error::Validation(format!(
                    "mode {:?} must not carry a daemon plan",
                    classification.mode
                )));
            }
        }
    }
    Ok(classification)
}

/// Resolve `template_slug` references: the template's persona (and
/// appended instructions) override whatever the classifier supplied.
pub fn apply_templates(plan: &mut [DaemonPlan], templates: &[TemplateConfig]) {
    for daemon in plan.iter_mut() {
        let Some(slug) = &daemon.template_slug else {
            continue;
        };
        let Some(template) = templates.iter().find(|t| &t.slug == slug) else {
            tracing::warn!(slug, "classifier referenced unknown template");
            continue;
        };
        daemon.role = template.role;
        daemon.role_label = template.label.clone();
        let mut persona = template.persona.clone();
        if !template.instructions.is_empty() {
            persona.push_str("\n\n");
            persona.push_str(&template.instructions);
        }
        daemon.persona = Some(persona);
        for tool in &template.tools {
            if !daemon.tools_needed.contains(tool) {
                daemon.tools_needed.push(tool.clone());
            }
        }
    }
}

fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "mode": {
                "type": "string",
                "enum": ["status", "quick", "daemon", "multi_daemon"],
            },
            "daemons": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": {"type": "integer"},
                        "role": {
                            "type": "string",
                            "enum": ["researcher", "coder", "writer", "analyst", "browser", "creator", "organizer"],
                        },
                        "role_label": {"type": "string"},
                        "template_slug": {"type": "string"},
                        "task_summary": {"type": "string"},
                        "tools_needed": {"type": "array", "items": {"type": "string"}},
                        "depends_on": {"type": "array", "items": {"type": "integer"}},
                        "persona": {"type": "string"},
                    },
                    "required": ["index", "role", "role_label", "task_summary"],
                },
            },
        },
        "required": ["mode"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_domain::config::ModelConfig;
    use cortex_domain::daemon::DaemonRole;
    use cortex_providers::client::ChatResponse;
    use cortex_providers::health::HealthTracker;
    use parking_lot::Mutex;

    struct FakeBackend {
        responses: Mutex<Vec<Result<String>>>,
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

    fn classifier(responses: Vec<Result<String>>) -> Classifier {
        let pool = Arc::new(ModelPool::from_config(
            &[ModelConfig {
                provider_id: "gw".into(),
                model: "router-1".into(),
                tags: vec!["router".into()],
                structured_latency_ms: 100,
            }],
            Arc::new(HealthTracker::default()),
        ));
        Classifier::new(
            Arc::new(FakeBackend {
                responses: Mutex::new(responses),
            }),
            pool,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn quick_classification() {
        let c = classifier(vec![Ok(r#"{"mode": "quick"}"#.into())]);
        let out = c.classify("hello", &[], &[]).await.unwrap();
        assert_eq!(out.mode, TaskMode::Quick);
        assert!(out.daemons.is_empty());
    }

    #[tokio::test]
    async fn daemon_plan_parses_and_validates() {
        let plan = serde_json::json!({
            "mode": "multi_daemon",
            "daemons": [
                {"index": 0, "role": "researcher", "role_label": "Scout", "task_summary": "find sources", "tools_needed": ["search_web"]},
                {"index": 1, "role": "writer", "role_label": "Writer", "task_summary": "write it up", "depends_on": [0]},
            ],
        });
        let c = classifier(vec![Ok(plan.to_string())]);
        let out = c.classify("research and write", &[], &[]).await.unwrap();
        assert_eq!(out.mode, TaskMode::MultiDaemon);
        assert_eq!(out.daemons.len(), 2);
        assert_eq!(out.daemons[1].depends_on, vec![0]);
    }

    #[tokio::test]
    async fn cyclic_plan_is_rejected_then_retried() {
        let bad = serde_json::json!({
            "mode": "multi_daemon",
            "daemons": [
                {"index": 0, "role": "coder", "role_label": "A", "task_summary": "a", "depends_on": [1]},
                {"index": 1, "role": "coder", "role_label": "B", "task_summary": "b", "depends_on": [0]},
            ],
        });
        let good = serde_json::json!({"mode": "quick"});
        let c = classifier(vec![Ok(bad.to_string()), Ok(good.to_string())]);
        let out = c.classify("do things", &[], &[]).await.unwrap();
        assert_eq!(out.mode, TaskMode::Quick);
    }

    #[tokio::test]
    async fn fenced_output_is_tolerated() {
        let c = classifier(vec![Ok("```json\n{\"mode\": \"quick\"}\n```".into())]);
        let out = c.classify("hi", &[], &[]).await.unwrap();
        assert_eq!(out.mode, TaskMode::Quick);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let c = classifier(vec![
            Err(Error::Other("down".into())),
            Err(Error::Other("down".into())),
            Err(Error::Other("down".into())),
        ]);
        assert!(c.classify("hi", &[], &[]).await.is_err());
    }

    #[test]
    fn template_overrides_persona_and_merges_tools() {
        let templates = vec![TemplateConfig {
            slug: "web-researcher".into(),
            role: DaemonRole::Researcher,
            label: "Web Researcher".into(),
            persona: "Source-driven.".into(),
            instructions: "Always cite.".into(),
            tools: vec!["search_web".into()],
        }];
        let mut plan = vec![DaemonPlan {
            index: 0,
            role: DaemonRole::Coder,
            role_label: "Whatever".into(),
            template_slug: Some("web-researcher".into()),
            task_summary: "look".into(),
            tools_needed: vec!["search_web".into()],
            depends_on: vec![],
            persona: Some("classifier persona".into()),
        }];
        apply_templates(&mut plan, &templates);
        assert_eq!(plan[0].role, DaemonRole::Researcher);
        assert_eq!(plan[0].role_label, "Web Researcher");
        let persona = plan[0].persona.as_deref().unwrap();
        assert!(persona.contains("Source-driven."));
        assert!(persona.contains("Always cite."));
        // No duplicate tool entries.
        assert_eq!(plan[0].tools_needed, vec!["search_web"]);
    }
}
