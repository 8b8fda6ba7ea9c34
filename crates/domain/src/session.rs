//! Per-user conversational session state (one row per user).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The per-user session object. Weakly references tasks and daemons by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub context_summary: String,
    /// Most-recent first, bounded ring of 50.
    #[serde(default)]
    pub recent_task_ids: Vec<Uuid>,
    #[serde(default)]
    pub active_daemon_ids: HashSet<Uuid>,
    #[serde(default)]
    pub active_task_ids: HashSet<Uuid>,
    #[serde(default)]
    pub pinned_skill_ids: HashSet<String>,
    /// Preferred model spec, e.g. `"gateway/large-1"`.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub completed_task_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

pub const RECENT_TASKS_CAP: usize = 50;

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            context_summary: String::new(),
            recent_task_ids: Vec::new(),
            active_daemon_ids: HashSet::new(),
            active_task_ids: HashSet::new(),
            pinned_skill_ids: HashSet::new(),
            model_id: None,
            message_count: 0,
            completed_task_count: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    /// Push a task id to the front of the recent ring, deduplicating and
    /// truncating to [`RECENT_TASKS_CAP`].
    pub fn push_recent_task(&mut self, task_id: Uuid) {
        self.recent_task_ids.retain(|id| *id != task_id);
        self.recent_task_ids.insert(0, task_id);
        self.recent_task_ids.truncate(RECENT_TASKS_CAP);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_ring_is_bounded_and_front_loaded() {
        let mut s = Session::new("u1");
        let ids: Vec<Uuid> = (0..60).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            s.push_recent_task(*id);
        }
        assert_eq!(s.recent_task_ids.len(), RECENT_TASKS_CAP);
        // Newest first.
        assert_eq!(s.recent_task_ids[0], ids[59]);
        // Oldest ten fell off.
        assert!(!s.recent_task_ids.contains(&ids[0]));
    }

    #[test]
    fn push_recent_task_dedupes() {
        let mut s = Session::new("u1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        s.push_recent_task(a);
        s.push_recent_task(b);
        s.push_recent_task(a);
        assert_eq!(s.recent_task_ids, vec![a, b]);
    }
}
