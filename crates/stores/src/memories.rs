//! Long-term memory store.
//!
//! `content_hash` is unique per user across active (non-archived) rows;
//! inserts of a duplicate hash are skipped. Every read on behalf of a
//! caller bumps `access_count` via [`MemoryStore::update_access`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cortex_domain::error::{Error, Result};
use cortex_domain::memory::Memory;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist;

pub struct MemoryStore {
    path: Option<PathBuf>,
    memories: RwLock<HashMap<Uuid, Memory>>,
}

impl MemoryStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "memories.json");
        let memories = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            memories: RwLock::new(memories),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, memories: &HashMap<Uuid, Memory>) {
        if let Some(path) = &self.path {
            persist::save(path, memories);
        }
    }

    /// Insert unless an active memory with the same hash exists for this
    /// user. Returns whether the row was inserted.
    pub fn insert_if_absent(&self, memory: Memory) -> Result<bool> {
        let mut memories = self.memories.write();
        let duplicate = memories.values().any(|m| {
            m.user_id == memory.user_id && !m.is_archived && m.content_hash == memory.content_hash
        });
        if duplicate {
            return Ok(false);
        }
        memories.insert(memory.id, memory);
        self.flush(&memories);
        Ok(true)
    }

    pub fn get(&self, user_id: &str, id: &Uuid) -> Result<Memory> {
        self.memories
            .read()
            .get(id)
            .filter(|m| m.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("memory {id}")))
    }

    pub fn active_for_user(&self, user_id: &str) -> Vec<Memory> {
        let mut out: Vec<Memory> = self
            .memories
            .read()
            .values()
            .filter(|m| m.user_id == user_id && !m.is_archived)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Bump access stats; called every time a memory is returned to a
    /// caller.
    pub fn update_access(&self, user_id: &str, id: &Uuid) -> Result<()> {
        let mut memories = self.memories.write();
        let memory = memories
            .get_mut(id)
            .filter(|m| m.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("memory {id}")))?;
        memory.access_count += 1;
        memory.last_accessed_at = Some(Utc::now());
        self.flush(&memories);
        Ok(())
    }

    pub fn archive(&self, user_id: &str, id: &Uuid) -> Result<()> {
        let mut memories = self.memories.write();
        let memory = memories
            .get_mut(id)
            .filter(|m| m.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("memory {id}")))?;
        if !memory.is_archived {
            memory.is_archived = true;
            memory.archived_at = Some(Utc::now());
        }
        self.flush(&memories);
        Ok(())
    }
}
