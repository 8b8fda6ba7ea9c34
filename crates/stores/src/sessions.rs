//! Per-user session store (one row per user).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cortex_domain::error::{Error, Result};
use cortex_domain::session::Session;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist;

pub struct SessionStore {
    path: Option<PathBuf>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "sessions.json");
        let sessions = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            sessions: RwLock::new(sessions),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, sessions: &HashMap<String, Session>) {
        if let Some(path) = &self.path {
            persist::save(path, sessions);
        }
    }

    /// Fetch the user's session, creating it on first contact. A create
    /// racing another create re-reads and returns the existing row.
    pub fn get_or_create(&self, user_id: &str) -> Session {
        // Fast path.
        {
            let sessions = self.sessions.read();
            if let Some(s) = sessions.get(user_id) {
                return s.clone();
            }
        }
        // Slow path: the entry may have appeared between the read and the
        // write lock; `or_insert_with` absorbs that race.
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(user_id.to_owned())
            .or_insert_with(|| Session::new(user_id))
            .clone();
        self.flush(&sessions);
        session
    }

    pub fn get(&self, user_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session for {user_id}")))
    }

    pub fn update<F>(&self, user_id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(user_id.to_owned())
            .or_insert_with(|| Session::new(user_id));
        f(session);
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        self.flush(&sessions);
        Ok(snapshot)
    }

    pub fn touch(&self, user_id: &str) {
        let _ = self.update(user_id, |s| {
            s.last_activity_at = Utc::now();
        });
    }

    pub fn add_recent_task(&self, user_id: &str, task_id: Uuid) {
        let _ = self.update(user_id, |s| s.push_recent_task(task_id));
    }

    pub fn track_active(&self, user_id: &str, task_id: Uuid, daemon_ids: &[Uuid]) {
        let _ = self.update(user_id, |s| {
            s.active_task_ids.insert(task_id);
            s.active_daemon_ids.extend(daemon_ids.iter().copied());
        });
    }

    pub fn untrack_active(&self, user_id: &str, task_id: Uuid, daemon_ids: &[Uuid]) {
        let _ = self.update(user_id, |s| {
            s.active_task_ids.remove(&task_id);
            for id in daemon_ids {
                s.active_daemon_ids.remove(id);
            }
        });
    }

    /// Startup recovery: reattach each session's in-flight task ids to the
    /// front of `recent_task_ids`, then clear both active sets.
    pub fn clear_all_active(&self) -> usize {
        let mut sessions = self.sessions.write();
        let mut touched = 0usize;
        for session in sessions.values_mut() {
            if session.active_task_ids.is_empty() && session.active_daemon_ids.is_empty() {
                continue;
            }
            let mut orphaned: Vec<Uuid> = session.active_task_ids.iter().copied().collect();
            orphaned.sort();
            for task_id in orphaned {
                session.push_recent_task(task_id);
            }
            session.active_task_ids.clear();
            session.active_daemon_ids.clear();
            session.updated_at = Utc::now();
            touched += 1;
        }
        if touched > 0 {
            self.flush(&sessions);
            tracing::info!(sessions = touched, "cleared active task/daemon tracking");
        }
        touched
    }

    pub fn all_user_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = SessionStore::in_memory();
        let a = store.get_or_create("u1");
        let b = store.get_or_create("u1");
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(a.created_at, b.created_at);
    }

    #[test]
    fn clear_all_active_reattaches_tasks() {
        let store = SessionStore::in_memory();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let d1 = Uuid::new_v4();
        store.get_or_create("u1");
        store.track_active("u1", t1, &[d1]);
        store.track_active("u1", t2, &[]);

        assert_eq!(store.clear_all_active(), 1);
        let s = store.get("u1").unwrap();
        assert!(s.active_task_ids.is_empty());
        assert!(s.active_daemon_ids.is_empty());
        assert!(s.recent_task_ids.contains(&t1));
        assert!(s.recent_task_ids.contains(&t2));
    }

    #[test]
    fn clear_all_active_skips_quiet_sessions() {
        let store = SessionStore::in_memory();
        store.get_or_create("u1");
        assert_eq!(store.clear_all_active(), 0);
    }

    #[test]
    fn untrack_removes_only_given_ids() {
        let store = SessionStore::in_memory();
        let t1 = Uuid::new_v4();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        store.track_active("u1", t1, &[d1, d2]);
        store.untrack_active("u1", t1, &[d1]);
        let s = store.get("u1").unwrap();
        assert!(!s.active_task_ids.contains(&t1));
        assert!(!s.active_daemon_ids.contains(&d1));
        assert!(s.active_daemon_ids.contains(&d2));
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(Some(dir.path()));
            store.update("u1", |s| s.context_summary = "summary".into()).unwrap();
        }
        let store = SessionStore::new(Some(dir.path()));
        assert_eq!(store.get("u1").unwrap().context_summary, "summary");
    }
}
