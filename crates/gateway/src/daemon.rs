//! Daemon worker loop.
//!
//! One worker per daemon: build the prompt, subset tools, call the model,
//! execute tool calls, persist progress, repeat — up to the iteration cap.
//! Cancellation is observed before every model call and every tool call.
//! Transient model errors retry on another candidate; quota errors put the
//! candidate into cooldown first.

use std::time::Duration;

use cortex_domain::daemon::DaemonStatus;
use cortex_domain::error::{Error, Result};
use cortex_domain::event::CortexEvent;
use cortex_domain::tool::{Message, ToolCall, ToolDefinition};
use cortex_providers::client::{ChatRequest, ChatResponse};
use uuid::Uuid;

use crate::context::{self, DaemonContext};
use crate::pool::CancelToken;
use crate::state::AppState;

/// What the plan coordinator gets back from a finished worker.
#[derive(Debug, Clone)]
pub struct DaemonOutcome {
    pub daemon_id: Uuid,
    pub plan_index: usize,
    pub status: DaemonStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Generation call with failover: up to `max_retries` candidates from the
/// `generator` tag. Quota errors cool the candidate down before the next
/// attempt.
pub(crate) async fn call_generation(
    state: &AppState,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    model_preference: Option<&str>,
    max_retries: u32,
) -> Result<ChatResponse> {
    let timeout = Duration::from_secs(state.config.llm.generation_timeout_secs);
    let mut last_err: Option<Error> = None;

    for attempt in 0..max_retries.max(1) {
        // An explicit preference is honored on the first attempt only;
        // failover always goes through the pool.
        let (provider_id, model, pooled) = match model_preference.filter(|_| attempt == 0) {
            Some(spec) => match spec.split_once('/') {
                Some((p, m)) => (p.to_owned(), m.to_owned(), None),
                None => ("gateway".to_owned(), spec.to_owned(), None),
            },
            None => {
                let Some(candidate) = state.models.get_next("generator") else {
                    return Err(Error::Config("no models tagged 'generator'".into()));
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
        req.tools = tools.clone();
        req.temperature = Some(0.2);

        match state.backend.chat(&req, timeout).await {
            Ok(resp) => {
                if let Some(c) = &pooled {
                    state.models.record_success("generator", c);
                }
                return Ok(resp);
            }
            Err(e) if e.is_retryable_llm() => {
                if let Some(c) = &pooled {
                    let status = matches!(e, Error::LlmQuota { .. }).then_some(429);
                    state
                        .models
                        .record_failure("generator", c, &e.to_string(), status);
                }
                tracing::warn!(attempt, error = %e, "generation attempt failed, rotating model");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Other("generation failed".into())))
}

/// Execute one tool call: builtins run in-process, bridge tools go to the
/// user's client. Unknown names are non-retryable tool errors.
pub(crate) async fn dispatch_tool(
    state: &AppState,
    user_id: &str,
    call: &ToolCall,
    timeout: Duration,
) -> Result<String> {
    if state.registry.is_builtin(&call.tool_name) {
        return tokio::time::timeout(
            timeout,
            state.registry.execute_builtin(&call.tool_name, &call.arguments),
        )
        .await
        .map_err(|_| Error::Timeout(format!("tool {}", call.tool_name)))?;
    }
    if state.registry.is_user_tool(user_id, &call.tool_name) {
        return state
            .bridge
            .execute_tool_on_client(user_id, &call.tool_name, call.arguments.clone(), timeout)
            .await;
    }
    Err(Error::Tool {
        tool: call.tool_name.clone(),
        message: "unknown tool".into(),
    })
}

fn excerpt(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

/// Run one daemon to a terminal state. The returned outcome mirrors the
/// persisted record; the coordinator emits terminal events and advances
/// dependents.
pub async fn run_daemon(
    state: AppState,
    user_id: String,
    daemon_id: Uuid,
    conversation_id: String,
    dependency_results: Vec<(String, String)>,
    project_instructions: String,
    cancel: CancelToken,
) -> DaemonOutcome {
    match run_daemon_inner(
        &state,
        &user_id,
        daemon_id,
        &conversation_id,
        &dependency_results,
        &project_instructions,
        &cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // Fatal path: make sure a terminal record exists.
            let message = e.to_string();
            let plan_index = state
                .daemons
                .get(&user_id, &daemon_id)
                .map(|d| d.plan_index)
                .unwrap_or_default();
            let _ = state.daemons.update(&user_id, &daemon_id, |d| {
                d.current_action = message.clone();
                d.transition(DaemonStatus::Failed)
            });
            DaemonOutcome {
                daemon_id,
                plan_index,
                status: DaemonStatus::Failed,
                summary: None,
                error: Some(message),
            }
        }
    }
}

async fn run_daemon_inner(
    state: &AppState,
    user_id: &str,
    daemon_id: Uuid,
    conversation_id: &str,
    dependency_results: &[(String, String)],
    project_instructions: &str,
    cancel: &CancelToken,
) -> Result<DaemonOutcome> {
    let tool_timeout = Duration::from_secs(30);

    let mut daemon = state.daemons.transition(user_id, &daemon_id, DaemonStatus::Executing)?;
    let plan_index = daemon.plan_index;

    // Seed the conversation on first run.
    if daemon.messages.is_empty() {
        daemon = state.daemons.update(user_id, &daemon_id, |d| {
            d.messages.push(Message::user("Start on your task now."));
            Ok(())
        })?;
    }

    let skills: Vec<_> = state
        .config
        .skills
        .iter()
        .filter(|s| daemon.skill_ids.contains(&s.id))
        .cloned()
        .collect();

    let mut consecutive_tool_failures: u32 = 0;

    for iteration in 0..daemon.max_iterations {
        if cancel.is_cancelled() {
            return finish_cancelled(state, user_id, daemon_id, plan_index);
        }

        let system_prompt = context::build_daemon_prompt(&DaemonContext {
            daemon: &daemon,
            dependency_results,
            skills: &skills,
            project_instructions,
            dependency_result_max_chars: state.config.context.dependency_result_max_chars,
        });

        // Subset tools for this turn; a predictor failure degrades to the
        // full catalog rather than stalling the daemon.
        let available = state.registry.available_for_user(user_id);
        let tools = match state
            .predictor
            .predict(
                conversation_id,
                &daemon.task_summary,
                &available,
                &daemon.messages,
                None,
            )
            .await
        {
            Ok(subset) if !subset.is_empty() => subset,
            Ok(_) => available.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "tool prediction failed, using full catalog");
                available.clone()
            }
        };

        let mut messages = vec![Message::system(&system_prompt)];
        messages.extend(daemon.messages.iter().cloned());

        let response =
            call_generation(state, messages, tools, None, daemon.max_retries).await?;

        if cancel.is_cancelled() {
            return finish_cancelled(state, user_id, daemon_id, plan_index);
        }

        // A summary without tool calls ends the run.
        if response.tool_calls.is_empty() {
            let summary = response.content.clone();
            state.daemons.update(user_id, &daemon_id, |d| {
                d.messages.push(Message::assistant(&summary));
                d.result = Some(summary.clone());
                d.current_action = "done".into();
                d.transition(DaemonStatus::Completed)
            })?;
            return Ok(DaemonOutcome {
                daemon_id,
                plan_index,
                status: DaemonStatus::Completed,
                summary: Some(summary),
                error: None,
            });
        }

        // Record the assistant turn, then run the tools.
        let tool_calls = response.tool_calls.clone();
        daemon = state.daemons.update(user_id, &daemon_id, |d| {
            d.messages.push(Message::assistant_with_tools(
                &response.content,
                tool_calls.clone(),
            ));
            d.iterations = iteration + 1;
            d.current_action = format!("calling {}", tool_calls[0].tool_name);
            Ok(())
        })?;

        for call in &tool_calls {
            if cancel.is_cancelled() {
                return finish_cancelled(state, user_id, daemon_id, plan_index);
            }
            match dispatch_tool(state, user_id, call, tool_timeout).await {
                Ok(result) => {
                    consecutive_tool_failures = 0;
                    state
                        .predictor
                        .add_tool_to_cache(conversation_id, &call.tool_name)
                        .await;
                    daemon = state.daemons.update(user_id, &daemon_id, |d| {
                        d.messages.push(Message::tool_result(&call.call_id, &result));
                        d.working_memory
                            .push(format!("{}: {}", call.tool_name, excerpt(&result, 200)));
                        Ok(())
                    })?;
                }
                Err(e) => {
                    consecutive_tool_failures += 1;
                    let message = e.to_string();
                    tracing::warn!(
                        daemon_id = %daemon_id,
                        tool = %call.tool_name,
                        failures = consecutive_tool_failures,
                        error = %message,
                        "tool call failed"
                    );
                    daemon = state.daemons.update(user_id, &daemon_id, |d| {
                        d.messages.push(Message::tool_result(
                            &call.call_id,
                            format!("tool error: {message}"),
                        ));
                        Ok(())
                    })?;
                    if consecutive_tool_failures >= daemon.max_retries {
                        let error = format!(
                            "tool {} failed {} times: {message}",
                            call.tool_name, consecutive_tool_failures
                        );
                        state.daemons.update(user_id, &daemon_id, |d| {
                            d.current_action = error.clone();
                            d.transition(DaemonStatus::Failed)
                        })?;
                        return Ok(DaemonOutcome {
                            daemon_id,
                            plan_index,
                            status: DaemonStatus::Failed,
                            summary: None,
                            error: Some(error),
                        });
                    }
                }
            }
        }

        // Progress tracks iterations; completion sets 1.0.
        let progress = 0.9 * (iteration + 1) as f32 / daemon.max_iterations as f32;
        daemon = state.daemons.update(user_id, &daemon_id, |d| {
            d.advance_progress(progress);
            Ok(())
        })?;
        state.bus.publish(
            user_id,
            CortexEvent::DaemonProgress {
                daemon_id,
                progress: daemon.progress,
                current_action: daemon.current_action.clone(),
            },
        );
    }

    let error = format!("iteration limit reached ({})", daemon.max_iterations);
    state.daemons.update(user_id, &daemon_id, |d| {
        d.current_action = error.clone();
        d.transition(DaemonStatus::Failed)
    })?;
    Ok(DaemonOutcome {
        daemon_id,
        plan_index,
        status: DaemonStatus::Failed,
        summary: None,
        error: Some(error),
    })
}

fn finish_cancelled(
    state: &AppState,
    user_id: &str,
    daemon_id: Uuid,
    plan_index: usize,
) -> Result<DaemonOutcome> {
    // Partial work (messages, working memory, iterations) is already
    // persisted; only the status flips.
    state.daemons.update(user_id, &daemon_id, |d| {
        d.current_action = "cancelled".into();
        d.transition(DaemonStatus::Cancelled)
    })?;
    Ok(DaemonOutcome {
        daemon_id,
        plan_index,
        status: DaemonStatus::Cancelled,
        summary: None,
        error: None,
    })
}
