//! Project store: per-user named projects carrying prompt-level
//! instructions that the context builder appends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cortex_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct ProjectStore {
    path: Option<PathBuf>,
    projects: RwLock<HashMap<String, Project>>,
}

impl ProjectStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "projects.json");
        let projects = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            projects: RwLock::new(projects),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, projects: &HashMap<String, Project>) {
        if let Some(path) = &self.path {
            persist::save(path, projects);
        }
    }

    pub fn upsert(&self, user_id: &str, id: &str, name: &str, instructions: &str) -> Project {
        let now = Utc::now();
        let mut projects = self.projects.write();
        let project = projects
            .entry(id.to_owned())
            .and_modify(|p| {
                p.name = name.to_owned();
                p.instructions = instructions.to_owned();
                p.updated_at = now;
            })
            .or_insert_with(|| Project {
                id: id.to_owned(),
                user_id: user_id.to_owned(),
                name: name.to_owned(),
                instructions: instructions.to_owned(),
                created_at: now,
                updated_at: now,
            })
            .clone();
        self.flush(&projects);
        project
    }

    pub fn get(&self, user_id: &str, id: &str) -> Result<Project> {
        self.projects
            .read()
            .get(id)
            .filter(|p| p.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    /// Project instructions, or empty when the project is missing.
    pub fn instructions_for(&self, user_id: &str, project_id: Option<&str>) -> String {
        let Some(id) = project_id else {
            return String::new();
        };
        self.get(user_id, id)
            .map(|p| p.instructions)
            .unwrap_or_default()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Project> {
        self.projects
            .read()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }
}
