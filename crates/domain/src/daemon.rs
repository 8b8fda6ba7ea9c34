//! Daemon entity, plan shapes, and the daemon status machine.
//!
//! A daemon is a single LLM-backed worker pursuing a sub-task with tool
//! access. The classifier plans one or more daemons per task; `plan_index`
//! and `depends_on` encode the dependency DAG within one plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tool::Message;

pub const MAX_ITERATIONS: u32 = 25;
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonRole {
    Researcher,
    Coder,
    Writer,
    Analyst,
    Browser,
    Creator,
    Organizer,
}

impl DaemonRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonRole::Researcher => "researcher",
            DaemonRole::Coder => "coder",
            DaemonRole::Writer => "writer",
            DaemonRole::Analyst => "analyst",
            DaemonRole::Browser => "browser",
            DaemonRole::Creator => "creator",
            DaemonRole::Organizer => "organizer",
        }
    }
}

impl std::fmt::Display for DaemonRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Idle,
    Executing,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl DaemonStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DaemonStatus::Completed | DaemonStatus::Failed | DaemonStatus::Cancelled
        )
    }

    /// A daemon may leave `executing` only into a terminal state or
    /// `waiting_input`; `waiting_input` resumes into `executing`.
    pub fn can_transition_to(&self, next: DaemonStatus) -> bool {
        use DaemonStatus::*;
        match (self, next) {
            (Idle, Executing) | (Idle, Cancelled) | (Idle, Failed) => true,
            (Executing, WaitingInput)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Executing, Cancelled) => true,
            (WaitingInput, Executing)
            | (WaitingInput, Completed)
            | (WaitingInput, Failed)
            | (WaitingInput, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonStatus::Idle => "idle",
            DaemonStatus::Executing => "executing",
            DaemonStatus::WaitingInput => "waiting_input",
            DaemonStatus::Completed => "completed",
            DaemonStatus::Failed => "failed",
            DaemonStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan shapes (classifier output)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One planned daemon as emitted by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonPlan {
    pub index: usize,
    pub role: DaemonRole,
    pub role_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_slug: Option<String>,
    pub task_summary: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    /// Indices (into the same plan) this daemon depends on.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl DaemonPlan {
    /// Validate the dependency DAG of a whole plan: unique in-range
    /// indices, no self-dependency, no cycles.
    pub fn validate_plan(plan: &[DaemonPlan]) -> Result<()> {
        let n = plan.len();
        let mut seen_indices = std::collections::HashSet::new();
        for d in plan {
            if !seen_indices.insert(d.index) {
                return Err(Error::Validation(format!(
                    "duplicate daemon index {}",
                    d.index
                )));
            }
            if d.index >= n {
                return Err(Error::Validation(format!(
                    "daemon index {} out of range for plan of {n}",
                    d.index
                )));
            }
            for &dep in &d.depends_on {
                if dep >= n {
                    return Err(Error::Validation(format!(
                        "daemon {} depends on missing index {dep}",
                        d.index
                    )));
                }
                if dep == d.index {
                    return Err(Error::Validation(format!(
                        "daemon {} depends on itself",
                        d.index
                    )));
                }
            }
        }
        // Kahn's algorithm over plan indices to reject cycles.
        let mut indegree = vec![0usize; n];
        for d in plan {
            for _ in &d.depends_on {
                indegree[d.index] += 1;
            }
        }
        let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut seen = 0usize;
        while let Some(i) = queue.pop() {
            seen += 1;
            for d in plan {
                if d.depends_on.contains(&i) {
                    indegree[d.index] -= 1;
                    if indegree[d.index] == 0 {
                        queue.push(d.index);
                    }
                }
            }
        }
        if seen != n {
            return Err(Error::Validation("daemon plan contains a cycle".into()));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Daemon entity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
    pub id: Uuid,
    pub user_id: String,
    pub task_id: Uuid,
    pub role: DaemonRole,
    pub role_label: String,
    #[serde(default)]
    pub persona: String,
    pub task_summary: String,
    pub status: DaemonStatus,
    #[serde(default)]
    pub current_action: String,
    /// Non-decreasing while non-terminal; 1.0 on completion.
    #[serde(default)]
    pub progress: f32,
    pub plan_index: usize,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub iterations: u32,
    pub max_iterations: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub working_memory: Vec<String>,
    #[serde(default)]
    pub skill_ids: Vec<String>,
    #[serde(default)]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Daemon {
    pub fn from_plan(user_id: impl Into<String>, task_id: Uuid, plan: &DaemonPlan) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            task_id,
            role: plan.role,
            role_label: plan.role_label.clone(),
            persona: plan.persona.clone().unwrap_or_default(),
            task_summary: plan.task_summary.clone(),
            status: DaemonStatus::Idle,
            current_action: String::new(),
            progress: 0.0,
            plan_index: plan.index,
            depends_on: plan.depends_on.clone(),
            iterations: 0,
            max_iterations: MAX_ITERATIONS,
            max_retries: MAX_RETRIES,
            messages: Vec::new(),
            working_memory: Vec::new(),
            skill_ids: Vec::new(),
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: DaemonStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "daemon",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == DaemonStatus::Executing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if next == DaemonStatus::Completed {
                self.progress = 1.0;
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Raise progress; lowering is a no-op (progress is non-decreasing).
    pub fn advance_progress(&mut self, progress: f32) {
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
            self.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(index: usize, depends_on: Vec<usize>) -> DaemonPlan {
        DaemonPlan {
            index,
            role: DaemonRole::Researcher,
            role_label: "Research".into(),
            template_slug: None,
            task_summary: "look things up".into(),
            tools_needed: vec!["search_web".into()],
            depends_on,
            persona: None,
        }
    }

    #[test]
    fn executing_only_exits_to_terminal_or_waiting() {
        let mut d = Daemon::from_plan("u1", Uuid::new_v4(), &plan(0, vec![]));
        d.transition(DaemonStatus::Executing).unwrap();
        assert!(d.transition(DaemonStatus::Idle).is_err());
        d.transition(DaemonStatus::WaitingInput).unwrap();
        d.transition(DaemonStatus::Executing).unwrap();
        d.transition(DaemonStatus::Completed).unwrap();
        assert_eq!(d.progress, 1.0);
        assert!(d.transition(DaemonStatus::Executing).is_err());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut d = Daemon::from_plan("u1", Uuid::new_v4(), &plan(0, vec![]));
        d.advance_progress(0.4);
        d.advance_progress(0.2);
        assert_eq!(d.progress, 0.4);
        d.advance_progress(1.5);
        assert_eq!(d.progress, 1.0);
    }

    #[test]
    fn plan_validation_accepts_dag() {
        let p = vec![plan(0, vec![]), plan(1, vec![0]), plan(2, vec![0, 1])];
        DaemonPlan::validate_plan(&p).unwrap();
    }

    #[test]
    fn plan_validation_rejects_cycle() {
        let p = vec![plan(0, vec![1]), plan(1, vec![0])];
        assert!(DaemonPlan::validate_plan(&p).is_err());
    }

    #[test]
    fn plan_validation_rejects_self_dependency() {
        let p = vec![plan(0, vec![0])];
        assert!(DaemonPlan::validate_plan(&p).is_err());
    }

    #[test]
    fn plan_validation_rejects_out_of_range() {
        let p = vec![plan(0, vec![3])];
        assert!(DaemonPlan::validate_plan(&p).is_err());
    }

    #[test]
    fn plan_validation_rejects_duplicate_indices() {
        let p = vec![plan(0, vec![]), plan(0, vec![])];
        assert!(DaemonPlan::validate_plan(&p).is_err());
    }
}
