//! Typed events published on the per-user event bus.
//!
//! Every event is a tagged union: a `type` string plus a payload whose shape
//! is fully determined by the tag.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daemon::{DaemonPlan, DaemonRole};
use crate::task::{TaskMode, TaskResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CortexEvent {
    ClassificationStarted {
        task_id: Uuid,
    },
    ClassificationComplete {
        task_id: Uuid,
        mode: TaskMode,
        daemons: Vec<DaemonPlan>,
    },
    DaemonCreated {
        daemon_id: Uuid,
        role: DaemonRole,
        role_label: String,
        plan_index: usize,
    },
    DaemonProgress {
        daemon_id: Uuid,
        progress: f32,
        current_action: String,
    },
    DaemonCompleted {
        daemon_id: Uuid,
        summary: String,
    },
    DaemonFailed {
        daemon_id: Uuid,
        error: String,
    },
    CortexResponse {
        task_id: Uuid,
        content: String,
    },
    TaskCompleted {
        task_id: Uuid,
        result: TaskResult,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    BridgeStateUpdated {
        bridge_connected: bool,
    },
    Error {
        message: String,
    },
}

impl CortexEvent {
    /// Whether this event ends a task (the sync wrappers stop draining here).
    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self,
            CortexEvent::TaskCompleted { .. } | CortexEvent::TaskFailed { .. }
        )
    }
}
