//! The Cortex orchestrator: end-to-end handling of one user message.
//!
//! Persist the task, classify intent, then route: answer directly
//! (`quick`), report running work (`status`), or plan daemons with
//! dependency ordering under the per-user admission cap. All observers
//! follow along on the event bus; the sync wrappers subscribe internally
//! and translate the terminal event into a response string.

use std::collections::{HashMap, HashSet};

use cortex_domain::daemon::{Daemon, DaemonPlan, DaemonStatus};
use cortex_domain::engram::{EngramEntry, EngramType};
use cortex_domain::error::{Error, Result};
use cortex_domain::event::CortexEvent;
use cortex_domain::task::{Task, TaskMode, TaskResult, TaskSource, TaskStatus};
use cortex_domain::tool::Message;
use cortex_memory::compute_engagement;
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::{self, CortexContext};
use crate::daemon::{call_generation, dispatch_tool, run_daemon, DaemonOutcome};
use crate::scheduler::{RoutineExecutor, Schedule};
use crate::state::AppState;

const SYNC_EVENT_BUFFER: usize = 256;
const QUICK_TOOL_LOOPS: usize = 3;
const DEFAULT_ERROR_REPLY: &str = "I encountered an error processing your request.";

#[derive(Debug, Clone)]
struct RunOptions {
    source: TaskSource,
    routine_id: Option<String>,
    model_id: Option<String>,
    /// Routine tasks skip session and project tracking.
    track_session: bool,
}

pub struct CortexOrchestrator {
    state: AppState,
}

impl CortexOrchestrator {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Entry points
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Fire-and-stream: persists the task, spawns the run, and returns
    /// the task id. All progress flows through the event bus.
    pub async fn handle_user_message(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<String>,
        model_id: Option<String>,
    ) -> Result<Uuid> {
        let opts = RunOptions {
            source: TaskSource::User,
            routine_id: None,
            model_id,
            track_session: true,
        };
        let task = self.create_task(user_id, message, session_id, &opts)?;
        let task_id = task.id;
        let state = self.state.clone();
        tokio::spawn(async move {
            Self::run_task(state, task, opts).await;
        });
        Ok(task_id)
    }

    /// Synchronous variant: drains the bus until the task's terminal
    /// event and returns the response string.
    pub async fn handle_user_message_sync(
        &self,
        user_id: &str,
        message: &str,
        model_id: Option<String>,
    ) -> Result<String> {
        self.run_sync(
            user_id,
            message,
            RunOptions {
                source: TaskSource::User,
                routine_id: None,
                model_id,
                track_session: true,
            },
        )
        .await
    }

    /// Scheduled-routine variant: tags the task with the routine id and
    /// skips session/project tracking.
    pub async fn handle_routine_sync(
        &self,
        user_id: &str,
        message: &str,
        routine_id: &str,
    ) -> Result<String> {
        self.run_sync(
            user_id,
            message,
            RunOptions {
                source: TaskSource::Routine,
                routine_id: Some(routine_id.to_owned()),
                model_id: None,
                track_session: false,
            },
        )
        .await
    }

    /// Re-run a terminal task's prompt as a fresh task.
    pub async fn retry_task(&self, user_id: &str, task_id: &Uuid) -> Result<Uuid> {
        let old = self.state.tasks.get(user_id, task_id)?;
        if !old.status.is_terminal() {
            return Err(Error::Validation(format!("task {task_id} is still running")));
        }
        let opts = RunOptions {
            source: TaskSource::ManualRetry,
            routine_id: None,
            model_id: None,
            track_session: true,
        };
        let task = self.create_task(user_id, &old.prompt, old.session_id.clone(), &opts)?;
        let task = self.state.tasks.update(user_id, &task.id, |t| {
            t.retry_of_task_id = Some(old.id);
            Ok(())
        })?;
        let task_id = task.id;
        let state = self.state.clone();
        tokio::spawn(async move {
            Self::run_task(state, task, opts).await;
        });
        Ok(task_id)
    }

    /// Cooperative cancellation of a running task and all its daemons.
    pub fn cancel_task(&self, user_id: &str, task_id: &Uuid) -> Result<usize> {
        let task = self.state.tasks.get(user_id, task_id)?;
        if task.status.is_terminal() {
            return Ok(0);
        }
        let mut signalled = 0usize;
        for daemon in self.state.daemons.list_for_task(user_id, task_id) {
            if self.state.daemon_pool.cancel(&daemon.id) {
                signalled += 1;
            }
        }
        Ok(signalled)
    }

    async fn run_sync(&self, user_id: &str, message: &str, opts: RunOptions) -> Result<String> {
        let subscriber_id = format!("sync-{}", Uuid::new_v4());
        let mut rx = self
            .state
            .bus
            .subscribe(user_id, &subscriber_id, SYNC_EVENT_BUFFER);

        let task = match self.create_task(user_id, message, None, &opts) {
            Ok(task) => task,
            Err(e) => {
                self.state.bus.unsubscribe(user_id, &subscriber_id);
                return Err(e);
            }
        };
        let task_id = task.id;
        let state = self.state.clone();
        let run = tokio::spawn(async move {
            Self::run_task(state, task, opts).await;
        });

        // The run publishes its terminal event before returning, so after
        // the join every event for this task sits in our buffer.
        let _ = run.await;
        let mut outcome: Option<Result<String>> = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                CortexEvent::TaskCompleted { task_id: id, result } if id == task_id => {
                    outcome = Some(Ok(result.summary));
                    break;
                }
                CortexEvent::TaskFailed { task_id: id, error } if id == task_id => {
                    let message = if error.is_empty() {
                        DEFAULT_ERROR_REPLY.to_owned()
                    } else {
                        error
                    };
                    outcome = Some(Err(Error::Other(message)));
                    break;
                }
                _ => {}
            }
        }
        self.state.bus.unsubscribe(user_id, &subscriber_id);

        // The terminal event can only be missing if our buffer
        // overflowed; fall back to the persisted row.
        outcome.unwrap_or_else(|| match self.state.tasks.get(user_id, &task_id) {
            Ok(task) => match (task.status, task.result, task.error) {
                (TaskStatus::Completed, Some(result), _) => Ok(result.summary),
                (_, _, Some(error)) => Err(Error::Other(error)),
                _ => Err(Error::Other(DEFAULT_ERROR_REPLY.to_owned())),
            },
            Err(e) => Err(e),
        })
    }

    fn create_task(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<String>,
        opts: &RunOptions,
    ) -> Result<Task> {
        if message.trim().is_empty() {
            return Err(Error::Validation("message must not be empty".into()));
        }
        let mut task = Task::new(user_id, message, opts.source);
        task.session_id = session_id;
        task.routine_id = opts.routine_id.clone();
        self.state.tasks.insert(task.clone())?;
        if opts.track_session {
            self.state.sessions.get_or_create(user_id);
            self.state.sessions.touch(user_id);
        }
        Ok(task)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Task run
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn run_task(state: AppState, task: Task, opts: RunOptions) {
        let user_id = task.user_id.clone();
        let task_id = task.id;
        if let Err(e) = Self::run_task_inner(&state, &task, &opts).await {
            fail_task(&state, &user_id, &task_id, &e.to_string());
        }
    }

    async fn run_task_inner(state: &AppState, task: &Task, opts: &RunOptions) -> Result<()> {
        let user_id = &task.user_id;

        // Admission: every user-originated message counts against the
        // tier window. Routines are system work and bypass it.
        if matches!(opts.source, TaskSource::User | TaskSource::ManualRetry | TaskSource::Channel)
        {
            if let Err(e) = state.limiter.check_message(user_id).await {
                let payload = match &e {
                    Error::LimitExceeded(p) => serde_json::to_string(p).unwrap_or_default(),
                    _ => e.to_string(),
                };
                fail_task(state, user_id, &task.id, &payload);
                return Ok(());
            }
        }

        state.tasks.transition(user_id, &task.id, TaskStatus::Classifying)?;
        state
            .bus
            .publish(user_id, CortexEvent::ClassificationStarted { task_id: task.id });

        let active = state.daemons.active_for_user(user_id);
        let classification = state
            .classifier
            .classify(&task.prompt, &active, &state.config.templates)
            .await?;

        state.tasks.update(user_id, &task.id, |t| {
            t.mode = classification.mode;
            t.goal = summarize_goal(&classification.daemons, &t.prompt);
            Ok(())
        })?;
        state.bus.publish(
            user_id,
            CortexEvent::ClassificationComplete {
                task_id: task.id,
                mode: classification.mode,
                daemons: classification.daemons.clone(),
            },
        );

        match classification.mode {
            TaskMode::Status => Self::status_path(state, task, &active),
            TaskMode::Quick => Self::quick_path(state, task, opts).await,
            TaskMode::Daemon | TaskMode::MultiDaemon => {
                Self::daemon_path(state, task, classification.daemons, opts).await
            }
            TaskMode::Draft => Err(Error::Validation("classifier returned draft mode".into())),
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    fn status_path(state: &AppState, task: &Task, active: &[Daemon]) -> Result<()> {
        let summary = render_status(active);
        let result = TaskResult {
            summary,
            artifacts: Vec::new(),
        };
        state.tasks.update(&task.user_id, &task.id, |t| {
            t.result = Some(result.clone());
            t.transition(TaskStatus::Completed)
        })?;
        state.bus.publish(
            &task.user_id,
            CortexEvent::TaskCompleted {
                task_id: task.id,
                result,
            },
        );
        Ok(())
    }

    // ── Quick ───────────────────────────────────────────────────────

    async fn quick_path(state: &AppState, task: &Task, opts: &RunOptions) -> Result<()> {
        let user_id = &task.user_id;
        state.tasks.transition(user_id, &task.id, TaskStatus::Executing)?;

        let session = state.sessions.get_or_create(user_id);
        let memories = state
            .memory
            .select_contents(user_id, &task.prompt)
            .await
            .unwrap_or_default();
        let engrams = state
            .engrams
            .recent(user_id, state.config.context.recent_engrams);
        let active = state.daemons.active_for_user(user_id);
        let project_instructions = if opts.track_session {
            state
                .projects
                .instructions_for(user_id, task.project_id.as_deref())
        } else {
            String::new()
        };

        let system_prompt = context::build_cortex_prompt(&CortexContext {
            persona_facts: "",
            memories: &memories[..memories.len().min(state.config.context.max_memories)],
            context_summary: &session.context_summary,
            active_daemons: &active,
            engrams: &engrams,
            project_instructions: &project_instructions,
        });

        let conversation = conversation_id(task);
        let available = state.registry.available_for_user(user_id);
        let model_pref = opts
            .model_id
            .clone()
            .or_else(|| session.model_id.clone());
        let tools = match state
            .predictor
            .predict(&conversation, &task.prompt, &available, &[], model_pref.as_deref())
            .await
        {
            Ok(subset) => subset,
            Err(e) => {
                tracing::warn!(error = %e, "tool prediction failed for quick turn");
                Vec::new()
            }
        };

        let mut messages = vec![Message::system(&system_prompt), Message::user(&task.prompt)];
        let mut content = String::new();
        for _ in 0..QUICK_TOOL_LOOPS {
            let response = call_generation(
                state,
                messages.clone(),
                tools.clone(),
                model_pref.as_deref(),
                3,
            )
            .await?;
            if response.tool_calls.is_empty() {
                content = response.content;
                break;
            }
            messages.push(Message::assistant_with_tools(
                &response.content,
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let result = match dispatch_tool(
                    state,
                    user_id,
                    call,
                    std::time::Duration::from_secs(30),
                )
                .await
                {
                    Ok(out) => {
                        state.predictor.add_tool_to_cache(&conversation, &call.tool_name).await;
                        out
                    }
                    Err(e) => format!("tool error: {e}"),
                };
                messages.push(Message::tool_result(&call.call_id, result));
            }
            // A model that still wants tools on the last loop gets cut
            // off with whatever text it produced.
            content = response.content;
        }
        if content.is_empty() {
            content = DEFAULT_ERROR_REPLY.to_owned();
        }

        let mut engram = EngramEntry::new(user_id, EngramType::DaemonOutput, excerpt(&content, 200));
        engram.session_id = task.session_id.clone();
        engram.content = Some(content.clone());
        engram.source = Some("cortex".into());
        state.engrams.append(engram)?;

        let result = TaskResult {
            summary: content.clone(),
            artifacts: Vec::new(),
        };
        state.tasks.update(user_id, &task.id, |t| {
            t.result = Some(result.clone());
            t.transition(TaskStatus::Completed)
        })?;

        state.bus.publish(
            user_id,
            CortexEvent::CortexResponse {
                task_id: task.id,
                content: content.clone(),
            },
        );
        state.bus.publish(
            user_id,
            CortexEvent::TaskCompleted {
                task_id: task.id,
                result,
            },
        );

        if opts.track_session {
            let task_id = task.id;
            let _ = state.sessions.update(user_id, |s| {
                s.message_count += 1;
                s.completed_task_count += 1;
                s.push_recent_task(task_id);
            });

            // Fire-and-forget extraction of durable facts from the
            // closing exchange.
            let memory = state.memory.clone();
            let user_id = user_id.clone();
            let prompt = task.prompt.clone();
            let reply = content;
            tokio::spawn(async move {
                let engagement = compute_engagement(1, 2, reply.len(), 0.0);
                let turns = vec![Message::user(prompt), Message::assistant(reply)];
                if let Err(e) = memory.extract(&user_id, &turns, engagement).await {
                    tracing::debug!(error = %e, "memory extraction skipped");
                }
            });
        }
        Ok(())
    }

    // ── Daemon / multi-daemon ───────────────────────────────────────

    async fn daemon_path(
        state: &AppState,
        task: &Task,
        plan: Vec<DaemonPlan>,
        opts: &RunOptions,
    ) -> Result<()> {
        let user_id = &task.user_id;
        state.tasks.transition(user_id, &task.id, TaskStatus::Executing)?;

        // Admission: one slot per planned daemon, all or nothing.
        let mut permits = Vec::with_capacity(plan.len());
        for _ in &plan {
            match state.daemon_pool.try_acquire_slot(user_id) {
                Ok(permit) => permits.push(permit),
                Err(e) => {
                    drop(permits);
                    let payload = match &e {
                        Error::CapacityExceeded { limit, used } => format!(
                            "{{\"error_code\":\"capacity_exceeded\",\"limit\":{limit},\"used\":{used}}}"
                        ),
                        _ => e.to_string(),
                    };
                    fail_task(state, user_id, &task.id, &payload);
                    return Ok(());
                }
            }
        }

        // Create the persisted rows.
        let session = state.sessions.get_or_create(user_id);
        let mut ids_by_index: HashMap<usize, Uuid> = HashMap::new();
        let mut daemon_ids = Vec::new();
        for planned in &plan {
            let mut daemon = Daemon::from_plan(user_id, task.id, planned);
            daemon.skill_ids = session.pinned_skill_ids.iter().cloned().collect();
            ids_by_index.insert(planned.index, daemon.id);
            daemon_ids.push(daemon.id);
            let created = CortexEvent::DaemonCreated {
                daemon_id: daemon.id,
                role: daemon.role,
                role_label: daemon.role_label.clone(),
                plan_index: daemon.plan_index,
            };
            state.daemons.insert(daemon)?;
            state.bus.publish(user_id, created);
        }
        state.tasks.update(user_id, &task.id, |t| {
            if t.mode == TaskMode::Daemon {
                t.daemon_id = daemon_ids.first().copied();
            }
            Ok(())
        })?;
        if opts.track_session {
            state.sessions.track_active(user_id, task.id, &daemon_ids);
        }

        let project_instructions = if opts.track_session {
            state
                .projects
                .instructions_for(user_id, task.project_id.as_deref())
        } else {
            String::new()
        };

        // Dependency-ordered execution: a daemon launches only after all
        // of its dependencies completed; a failed or cancelled dependency
        // cancels the whole downstream chain.
        let mut permit_by_index: HashMap<usize, _> = plan
            .iter()
            .map(|p| p.index)
            .zip(permits)
            .collect();
        let mut outcomes: HashMap<usize, DaemonStatus> = HashMap::new();
        let mut started: HashSet<usize> = HashSet::new();
        let mut join_set: JoinSet<DaemonOutcome> = JoinSet::new();
        let conversation = conversation_id(task);

        loop {
            // Launch newly-runnable daemons and cascade cancellations
            // until the frontier is stable.
            loop {
                let mut changed = false;
                for planned in &plan {
                    if started.contains(&planned.index) || outcomes.contains_key(&planned.index) {
                        continue;
                    }
                    let dep_failed = planned.depends_on.iter().any(|d| {
                        matches!(
                            outcomes.get(d),
                            Some(DaemonStatus::Failed) | Some(DaemonStatus::Cancelled)
                        )
                    });
                    if dep_failed {
                        let daemon_id = ids_by_index[&planned.index];
                        let _ = state.daemons.update(user_id, &daemon_id, |d| {
                            d.current_action = "dependency_failed".into();
                            d.transition(DaemonStatus::Cancelled)
                        });
                        outcomes.insert(planned.index, DaemonStatus::Cancelled);
                        permit_by_index.remove(&planned.index);
                        changed = true;
                        continue;
                    }
                    let runnable = planned
                        .depends_on
                        .iter()
                        .all(|d| outcomes.get(d) == Some(&DaemonStatus::Completed));
                    if !runnable {
                        continue;
                    }

                    started.insert(planned.index);
                    changed = true;
                    let daemon_id = ids_by_index[&planned.index];
                    let cancel = state.daemon_pool.register_runner(daemon_id);
                    let permit = permit_by_index
                        .remove(&planned.index)
                        .expect("slot permit held until launch");
                    let dependency_results: Vec<(String, String)> = planned
                        .depends_on
                        .iter()
                        .filter_map(|d| {
                            let id = ids_by_index.get(d)?;
                            let row = state.daemons.get(user_id, id).ok()?;
                            Some((row.role_label, row.result.unwrap_or_default()))
                        })
                        .collect();

                    let state = state.clone();
                    let user_id = user_id.clone();
                    let conversation = conversation.clone();
                    let project_instructions = project_instructions.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        run_daemon(
                            state,
                            user_id,
                            daemon_id,
                            conversation,
                            dependency_results,
                            project_instructions,
                            cancel,
                        )
                        .await
                    });
                }
                if !changed {
                    break;
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "daemon worker panicked");
                    continue;
                }
            };
            state.daemon_pool.remove_runner(&outcome.daemon_id);
            outcomes.insert(outcome.plan_index, outcome.status);

            match outcome.status {
                DaemonStatus::Completed => {
                    let summary = outcome.summary.clone().unwrap_or_default();
                    let mut engram =
                        EngramEntry::new(user_id, EngramType::DaemonOutput, excerpt(&summary, 200));
                    engram.session_id = task.session_id.clone();
                    engram.content = Some(summary.clone());
                    engram.source = Some("daemon".into());
                    state.engrams.append(engram)?;
                    state.bus.publish(
                        user_id,
                        CortexEvent::DaemonCompleted {
                            daemon_id: outcome.daemon_id,
                            summary,
                        },
                    );
                }
                DaemonStatus::Failed => {
                    state.bus.publish(
                        user_id,
                        CortexEvent::DaemonFailed {
                            daemon_id: outcome.daemon_id,
                            error: outcome.error.clone().unwrap_or_default(),
                        },
                    );
                }
                _ => {}
            }
        }

        // Aggregate.
        let rows = state.daemons.list_for_task(user_id, &task.id);
        let all_completed = rows.iter().all(|d| d.status == DaemonStatus::Completed);
        if all_completed {
            let summary = match aggregate_results(state, task, &rows).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(error = %e, "aggregation failed, joining summaries");
                    rows.iter()
                        .filter_map(|d| d.result.clone())
                        .collect::<Vec<_>>()
                        .join("\n\n")
                }
            };
            let result = TaskResult {
                summary,
                artifacts: Vec::new(),
            };
            state.tasks.update(user_id, &task.id, |t| {
                t.result = Some(result.clone());
                t.transition(TaskStatus::Completed)
            })?;
            state.bus.publish(
                user_id,
                CortexEvent::TaskCompleted {
                    task_id: task.id,
                    result,
                },
            );
            if opts.track_session {
                let task_id = task.id;
                let _ = state.sessions.update(user_id, |s| {
                    s.message_count += 1;
                    s.completed_task_count += 1;
                    s.push_recent_task(task_id);
                });
            }
        } else {
            let error = rows
                .iter()
                .filter(|d| d.status == DaemonStatus::Failed)
                .map(|d| d.current_action.clone())
                .next()
                .unwrap_or_else(|| "daemon run did not complete".into());
            fail_task(state, user_id, &task.id, &error);
        }

        if opts.track_session {
            state.sessions.untrack_active(user_id, task.id, &daemon_ids);
            if !all_completed {
                let task_id = task.id;
                let _ = state.sessions.update(user_id, |s| s.push_recent_task(task_id));
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn conversation_id(task: &Task) -> String {
    task.session_id
        .clone()
        .unwrap_or_else(|| task.user_id.clone())
}

fn summarize_goal(plan: &[DaemonPlan], prompt: &str) -> String {
    if plan.is_empty() {
        prompt.to_owned()
    } else {
        plan.iter()
            .map(|p| p.task_summary.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn render_status(active: &[Daemon]) -> String {
    if active.is_empty() {
        return "No background work is running right now.".to_owned();
    }
    let mut out = format!("{} daemon(s) working:\n", active.len());
    for d in active {
        out.push_str(&format!(
            "- {} ({}): {} — {:.0}%{}\n",
            d.role_label,
            d.role,
            d.task_summary,
            d.progress * 100.0,
            if d.current_action.is_empty() {
                String::new()
            } else {
                format!(" — {}", d.current_action)
            },
        ));
    }
    out
}

async fn aggregate_results(state: &AppState, task: &Task, rows: &[Daemon]) -> Result<String> {
    let mut listing = String::new();
    for d in rows {
        listing.push_str(&format!(
            "## {} ({})\n{}\n\n",
            d.role_label,
            d.role,
            d.result.as_deref().unwrap_or("(no output)")
        ));
    }
    let messages = vec![
        Message::system(
            "Daemons finished working on the user's request. Synthesize their \
             results into one final response. Answer the user directly; do not \
             describe the daemons.",
        ),
        Message::user(format!(
            "Request: {}\n\nDaemon results:\n{listing}",
            task.prompt
        )),
    ];
    let response = call_generation(state, messages, Vec::new(), None, 3).await?;
    Ok(response.content)
}

fn fail_task(state: &AppState, user_id: &str, task_id: &Uuid, error: &str) {
    let update = state.tasks.update(user_id, task_id, |t| {
        t.error = Some(error.to_owned());
        // Failing is legal from every non-terminal status except draft.
        if t.status == TaskStatus::Pending {
            t.transition(TaskStatus::Classifying)?;
        }
        t.transition(TaskStatus::Failed)
    });
    if let Err(e) = update {
        tracing::warn!(task_id = %task_id, error = %e, "could not persist task failure");
    }
    state.bus.publish(
        user_id,
        CortexEvent::TaskFailed {
            task_id: *task_id,
            error: error.to_owned(),
        },
    );
}

fn excerpt(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routine executor wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl RoutineExecutor for CortexOrchestrator {
    async fn execute(&self, schedule: &Schedule, input: Value) -> Result<String> {
        let prompt = input
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or(&schedule.name)
            .to_owned();
        let user_id = input
            .get("__user_id__")
            .and_then(|v| v.as_str())
            .unwrap_or(&schedule.user_id)
            .to_owned();
        self.handle_routine_sync(&user_id, &prompt, &schedule.id.to_string())
            .await
    }
}
