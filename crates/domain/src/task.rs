//! Task entity and its status machine.
//!
//! A task is the unit of work created for every user message (or routine
//! firing). It owns zero or more daemons and carries the final result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// How the orchestrator decided to handle the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Draft,
    Status,
    Quick,
    Daemon,
    MultiDaemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Pending,
    Classifying,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal edges of the task status graph. Terminal states are absorbing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Draft, Pending) => true,
            (Pending, Classifying) | (Pending, Cancelled) => true,
            // Status-mode tasks complete straight out of classification;
            // classification itself can fail or be cancelled.
            (Classifying, Executing)
            | (Classifying, Completed)
            | (Classifying, Failed)
            | (Classifying, Cancelled) => true,
            (Executing, Completed) | (Executing, Failed) | (Executing, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Pending => "pending",
            TaskStatus::Classifying => "classifying",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Where the task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    User,
    ManualRetry,
    Routine,
    Channel,
}

/// An output artifact attached to a task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub prompt: String,
    /// Distilled goal (set after classification; equals the prompt until then).
    pub goal: String,
    pub source: TaskSource,
    #[serde(default)]
    pub retry_of_task_id: Option<Uuid>,
    #[serde(default)]
    pub routine_id: Option<String>,
    #[serde(default)]
    pub daemon_id: Option<Uuid>,
    #[serde(default)]
    pub sub_task_ids: Vec<Uuid>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>, source: TaskSource) -> Self {
        let now = Utc::now();
        let prompt = prompt.into();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            project_id: None,
            session_id: None,
            mode: TaskMode::Draft,
            status: TaskStatus::Pending,
            goal: prompt.clone(),
            prompt,
            source,
            retry_of_task_id: None,
            routine_id: None,
            daemon_id: None,
            sub_task_ids: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status, stamping `started_at`/`completed_at` on the
    /// relevant edges. Rejects transitions outside the status graph.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "task",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Executing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
