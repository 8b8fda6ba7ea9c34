//! Long-term memory facts extracted from conversations.
//!
//! Content is stored encrypted per user; `content_hash` is computed over the
//! normalized plaintext and is unique per user across active memories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    PersonalInfo,
    Preferences,
    Context,
    Fact,
    Instruction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub user_id: String,
    pub encrypted_content: String,
    pub category: MemoryCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Engagement of the source conversation, in [0, 1].
    pub source_engagement: f32,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

impl Memory {
    pub fn new(
        user_id: impl Into<String>,
        encrypted_content: impl Into<String>,
        category: MemoryCategory,
        content_hash: impl Into<String>,
        source_engagement: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            encrypted_content: encrypted_content.into(),
            category,
            tags: Vec::new(),
            access_count: 0,
            last_accessed_at: None,
            created_at: Utc::now(),
            source_engagement: source_engagement.clamp(0.0, 1.0),
            is_archived: false,
            archived_at: None,
            content_hash: content_hash.into(),
        }
    }
}
