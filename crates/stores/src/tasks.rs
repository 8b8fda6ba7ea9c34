//! Task persistence.
//!
//! All reads and mutations are scoped to `user_id`; status changes go
//! through [`cortex_domain::task::Task::transition`] so the status graph is
//! enforced at the storage boundary. A terminal write is the last
//! persistent write for that task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cortex_domain::error::{Error, Result};
use cortex_domain::task::{Task, TaskStatus};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist;

pub struct TaskStore {
    path: Option<PathBuf>,
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl TaskStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "tasks.json");
        let tasks = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            tasks: RwLock::new(tasks),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, tasks: &HashMap<Uuid, Task>) {
        if let Some(path) = &self.path {
            persist::save(path, tasks);
        }
    }

    pub fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task);
        self.flush(&tasks);
        Ok(())
    }

    pub fn get(&self, user_id: &str, id: &Uuid) -> Result<Task> {
        self.tasks
            .read()
            .get(id)
            .filter(|t| t.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Apply a mutation under the write lock. Rejected when the task is
    /// already terminal (terminal states are monotonic).
    pub fn update<F>(&self, user_id: &str, id: &Uuid, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if task.status.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: "task",
                from: task.status.to_string(),
                to: "mutation".into(),
            });
        }
        f(task)?;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.flush(&tasks);
        Ok(snapshot)
    }

    pub fn transition(&self, user_id: &str, id: &Uuid, next: TaskStatus) -> Result<Task> {
        self.update(user_id, id, |t| t.transition(next))
    }

    /// Set or unset the project reference, stamping `updated_at` in the
    /// same write.
    pub fn set_project_id(
        &self,
        user_id: &str,
        id: &Uuid,
        project_id: Option<String>,
    ) -> Result<Task> {
        self.update(user_id, id, |t| {
            t.project_id = project_id;
            Ok(())
        })
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Delete a terminal task. Returns the ids of its daemons so the caller
    /// can cascade the delete.
    pub fn delete_terminal(&self, user_id: &str, id: &Uuid) -> Result<Vec<Uuid>> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get(id)
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if !task.status.is_terminal() {
            return Err(Error::Validation(format!(
                "task {id} is {} and cannot be deleted",
                task.status
            )));
        }
        let daemon_ids = task.daemon_id.into_iter().collect();
        tasks.remove(id);
        self.flush(&tasks);
        Ok(daemon_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_domain::task::TaskSource;

    fn task(user: &str) -> Task {
        Task::new(user, "do something", TaskSource::User)
    }

    #[test]
    fn insert_and_get_are_user_scoped() {
        let store = TaskStore::in_memory();
        let t = task("u1");
        let id = t.id;
        store.insert(t).unwrap();
        assert!(store.get("u1", &id).is_ok());
        assert!(matches!(store.get("u2", &id), Err(Error::NotFound(_))));
    }

    #[test]
    fn terminal_write_is_last() {
        let store = TaskStore::in_memory();
        let t = task("u1");
        let id = t.id;
        store.insert(t).unwrap();
        store.transition("u1", &id, TaskStatus::Classifying).unwrap();
        store.transition("u1", &id, TaskStatus::Executing).unwrap();
        store.transition("u1", &id, TaskStatus::Completed).unwrap();
        // Any further mutation is rejected.
        assert!(store
            .update("u1", &id, |t| {
                t.error = Some("late".into());
                Ok(())
            })
            .is_err());
        assert!(store.get("u1", &id).unwrap().error.is_none());
    }

    #[test]
    fn duplicate_insert_rejected() {
        let store = TaskStore::in_memory();
        let t = task("u1");
        store.insert(t.clone()).unwrap();
        assert!(store.insert(t).is_err());
    }

    #[test]
    fn set_project_id_unset() {
        let store = TaskStore::in_memory();
        let mut t = task("u1");
        t.project_id = Some("p1".into());
        let id = t.id;
        store.insert(t).unwrap();
        let before = store.get("u1", &id).unwrap().updated_at;
        let after = store.set_project_id("u1", &id, None).unwrap();
        assert!(after.project_id.is_none());
        assert!(after.updated_at >= before);
    }

    #[test]
    fn delete_requires_terminal() {
        let store = TaskStore::in_memory();
        let t = task("u1");
        let id = t.id;
        store.insert(t).unwrap();
        assert!(store.delete_terminal("u1", &id).is_err());
        store.transition("u1", &id, TaskStatus::Classifying).unwrap();
        store.transition("u1", &id, TaskStatus::Failed).unwrap();
        store.delete_terminal("u1", &id).unwrap();
        assert!(store.get("u1", &id).is_err());
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let t = task("u1");
        let id = t.id;
        {
            let store = TaskStore::new(Some(dir.path()));
            store.insert(t).unwrap();
        }
        let store = TaskStore::new(Some(dir.path()));
        assert_eq!(store.get("u1", &id).unwrap().prompt, "do something");
    }
}
