//! JSON-file persistence shared by the document stores.
//!
//! Each store keeps its working set in memory and writes the whole map on
//! mutation. A persist failure is logged, never fatal: the in-memory state
//! stays authoritative for the life of the process.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn load_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "corrupt store file, starting empty");
            T::default()
        }),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable store file, starting empty");
            T::default()
        }
    }
}

pub fn save<T: Serialize>(path: &Path, value: &T) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to serialize store");
            return;
        }
    };
    if let Some(dir) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to create store dir");
            return;
        }
    }
    // Write-then-rename so a crash mid-write never truncates the store.
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, json) {
        tracing::warn!(path = %tmp.display(), error = %e, "failed to write store file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to replace store file");
    }
}

/// Resolve the file path for a store, `None` when running purely in memory.
pub fn store_path(state_path: Option<&Path>, file: &str) -> Option<PathBuf> {
    state_path.map(|p| p.join(file))
}
