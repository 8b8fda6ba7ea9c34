//! Engram entries — the time-ordered knowledge log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngramType {
    DaemonOutput,
    Note,
    Save,
    System,
}

/// A single entry in the per-user knowledge log. Entries with `expires_at`
/// are evicted by the store once the deadline passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramEntry {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub entry_type: EngramType,
    /// Optional lookup key (used by saved items).
    #[serde(default)]
    pub key: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl EngramEntry {
    pub fn new(
        user_id: impl Into<String>,
        entry_type: EngramType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: None,
            entry_type,
            key: None,
            summary: summary.into(),
            content: None,
            source: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}
