//! Engram log store: time-ordered entries with TTL eviction, plus the
//! saved-items surface (keyed `save` entries with idempotent registration).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cortex_domain::engram::{EngramEntry, EngramType};
use cortex_domain::error::{Error, Result};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist;

pub struct EngramStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<Uuid, EngramEntry>>,
}

impl EngramStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "engrams.json");
        let entries = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, entries: &HashMap<Uuid, EngramEntry>) {
        if let Some(path) = &self.path {
            persist::save(path, entries);
        }
    }

    pub fn append(&self, entry: EngramEntry) -> Result<Uuid> {
        let id = entry.id;
        let mut entries = self.entries.write();
        entries.insert(id, entry);
        self.flush(&entries);
        Ok(id)
    }

    /// Most-recent first, expired entries excluded (and evicted).
    pub fn recent(&self, user_id: &str, limit: usize) -> Vec<EngramEntry> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        entries.retain(|_, e| !e.is_expired(now));
        let mut out: Vec<EngramEntry> = entries
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        out
    }

    pub fn get(&self, user_id: &str, id: &Uuid) -> Result<EngramEntry> {
        let now = Utc::now();
        self.entries
            .read()
            .get(id)
            .filter(|e| e.user_id == user_id && !e.is_expired(now))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("engram {id}")))
    }

    /// Remove expired entries. Invoked by the scheduler tick.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.flush(&entries);
            tracing::debug!(count = removed, "evicted expired engrams");
        }
        removed
    }

    // ── Saved items ─────────────────────────────────────────────────

    /// Register a saved item under a stable key. Re-registering the same
    /// key returns the existing entry id unchanged.
    pub fn save_item(
        &self,
        user_id: &str,
        key: &str,
        summary: &str,
        content: Option<String>,
    ) -> Result<Uuid> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.values().find(|e| {
            e.user_id == user_id
                && e.entry_type == EngramType::Save
                && e.key.as_deref() == Some(key)
        }) {
            return Ok(existing.id);
        }
        let mut entry = EngramEntry::new(user_id, EngramType::Save, summary);
        entry.key = Some(key.to_owned());
        entry.content = content;
        let id = entry.id;
        entries.insert(id, entry);
        self.flush(&entries);
        Ok(id)
    }

    pub fn saved_items(&self, user_id: &str) -> Vec<EngramEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.user_id == user_id && e.entry_type == EngramType::Save)
            .cloned()
            .collect()
    }
}
