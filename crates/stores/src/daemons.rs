//! Daemon persistence.
//!
//! The in-memory cancel handles live in the gateway's DaemonPool; this
//! store owns the durable record. `cleanup_stale_daemons` converts zombies
//! left by a crash into `failed` rows at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cortex_domain::daemon::{Daemon, DaemonStatus};
use cortex_domain::error::{Error, Result};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist;

pub struct DaemonStore {
    path: Option<PathBuf>,
    daemons: RwLock<HashMap<Uuid, Daemon>>,
}

impl DaemonStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "daemons.json");
        let daemons = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            daemons: RwLock::new(daemons),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, daemons: &HashMap<Uuid, Daemon>) {
        if let Some(path) = &self.path {
            persist::save(path, daemons);
        }
    }

    pub fn insert(&self, daemon: Daemon) -> Result<()> {
        let mut daemons = self.daemons.write();
        if daemons.contains_key(&daemon.id) {
            return Err(Error::Validation(format!(
                "daemon {} already exists",
                daemon.id
            )));
        }
        daemons.insert(daemon.id, daemon);
        self.flush(&daemons);
        Ok(())
    }

    pub fn get(&self, user_id: &str, id: &Uuid) -> Result<Daemon> {
        self.daemons
            .read()
            .get(id)
            .filter(|d| d.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("daemon {id}")))
    }

    pub fn update<F>(&self, user_id: &str, id: &Uuid, f: F) -> Result<Daemon>
    where
        F: FnOnce(&mut Daemon) -> Result<()>,
    {
        let mut daemons = self.daemons.write();
        let daemon = daemons
            .get_mut(id)
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("daemon {id}")))?;
        if daemon.status.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: "daemon",
                from: daemon.status.to_string(),
                to: "mutation".into(),
            });
        }
        f(daemon)?;
        daemon.updated_at = Utc::now();
        let snapshot = daemon.clone();
        self.flush(&daemons);
        Ok(snapshot)
    }

    pub fn transition(&self, user_id: &str, id: &Uuid, next: DaemonStatus) -> Result<Daemon> {
        self.update(user_id, id, |d| d.transition(next))
    }

    pub fn list_for_task(&self, user_id: &str, task_id: &Uuid) -> Vec<Daemon> {
        let mut out: Vec<Daemon> = self
            .daemons
            .read()
            .values()
            .filter(|d| d.user_id == user_id && d.task_id == *task_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.plan_index);
        out
    }

    pub fn active_for_user(&self, user_id: &str) -> Vec<Daemon> {
        let mut out: Vec<Daemon> = self
            .daemons
            .read()
            .values()
            .filter(|d| d.user_id == user_id && !d.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|d| d.plan_index);
        out
    }

    pub fn delete_for_task(&self, user_id: &str, task_id: &Uuid) -> usize {
        let mut daemons = self.daemons.write();
        let before = daemons.len();
        daemons.retain(|_, d| !(d.user_id == user_id && d.task_id == *task_id));
        let removed = before - daemons.len();
        if removed > 0 {
            self.flush(&daemons);
        }
        removed
    }

    /// Startup sweep: daemons left in `executing`, `waiting_input`, or
    /// `idle` by a previous process become `failed` with a restart marker.
    pub fn cleanup_stale_daemons(&self) -> usize {
        let now = Utc::now();
        let mut daemons = self.daemons.write();
        let mut swept = 0usize;
        for daemon in daemons.values_mut() {
            if matches!(
                daemon.status,
                DaemonStatus::Executing | DaemonStatus::WaitingInput | DaemonStatus::Idle
            ) {
                daemon.status = DaemonStatus::Failed;
                daemon.current_action = "server restarted".into();
                daemon.completed_at = Some(now);
                daemon.updated_at = now;
                swept += 1;
            }
        }
        if swept > 0 {
            self.flush(&daemons);
            tracing::info!(count = swept, "converted stale daemons to failed");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_domain::daemon::{DaemonPlan, DaemonRole};

    fn daemon(user: &str, task_id: Uuid, index: usize) -> Daemon {
        Daemon::from_plan(
            user,
            task_id,
            &DaemonPlan {
                index,
                role: DaemonRole::Researcher,
                role_label: "Research".into(),
                template_slug: None,
                task_summary: "look it up".into(),
                tools_needed: vec![],
                depends_on: vec![],
                persona: None,
            },
        )
    }

    #[test]
    fn stale_cleanup_converts_non_terminal() {
        let store = DaemonStore::in_memory();
        let task_id = Uuid::new_v4();

        let idle = daemon("u1", task_id, 0);
        let mut executing = daemon("u1", task_id, 1);
        executing.transition(DaemonStatus::Executing).unwrap();
        let mut done = daemon("u1", task_id, 2);
        done.transition(DaemonStatus::Executing).unwrap();
        done.transition(DaemonStatus::Completed).unwrap();

        let (idle_id, exec_id, done_id) = (idle.id, executing.id, done.id);
        store.insert(idle).unwrap();
        store.insert(executing).unwrap();
        store.insert(done).unwrap();

        assert_eq!(store.cleanup_stale_daemons(), 2);
        for id in [idle_id, exec_id] {
            let d = store.get("u1", &id).unwrap();
            assert_eq!(d.status, DaemonStatus::Failed);
            assert_eq!(d.current_action, "server restarted");
        }
        assert_eq!(store.get("u1", &done_id).unwrap().status, DaemonStatus::Completed);
    }

    #[test]
    fn terminal_daemons_reject_mutation() {
        let store = DaemonStore::in_memory();
        let d = daemon("u1", Uuid::new_v4(), 0);
        let id = d.id;
        store.insert(d).unwrap();
        store.transition("u1", &id, DaemonStatus::Executing).unwrap();
        store.transition("u1", &id, DaemonStatus::Cancelled).unwrap();
        assert!(store
            .update("u1", &id, |d| {
                d.progress = 0.9;
                Ok(())
            })
            .is_err());
    }

    #[test]
    fn list_for_task_in_plan_order() {
        let store = DaemonStore::in_memory();
        let task_id = Uuid::new_v4();
        store.insert(daemon("u1", task_id, 2)).unwrap();
        store.insert(daemon("u1", task_id, 0)).unwrap();
        store.insert(daemon("u1", task_id, 1)).unwrap();
        let list = store.list_for_task("u1", &task_id);
        let order: Vec<usize> = list.iter().map(|d| d.plan_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn cascade_delete_for_task() {
        let store = DaemonStore::in_memory();
        let task_id = Uuid::new_v4();
        store.insert(daemon("u1", task_id, 0)).unwrap();
        store.insert(daemon("u1", task_id, 1)).unwrap();
        store.insert(daemon("u1", Uuid::new_v4(), 0)).unwrap();
        assert_eq!(store.delete_for_task("u1", &task_id), 2);
    }
}
