//! Versioned chat documents with optimistic concurrency.
//!
//! Every successful mutation increments `version` by exactly one. Writers
//! supply the version they read; a mismatch returns
//! [`Error::VersionConflict`] and changes nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cortex_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields settable through the upsert path.
#[derive(Debug, Clone, Default)]
pub struct ChatFields {
    pub title: Option<String>,
    pub project_id: Option<Option<String>>,
}

pub struct ChatStore {
    path: Option<PathBuf>,
    chats: RwLock<HashMap<String, Chat>>,
}

impl ChatStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "chats.json");
        let chats = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            chats: RwLock::new(chats),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, chats: &HashMap<String, Chat>) {
        if let Some(path) = &self.path {
            persist::save(path, chats);
        }
    }

    /// Atomic upsert: on insert the identity fields and `created_at` are
    /// set once and the version becomes 1; on update the given fields are
    /// applied and the version is incremented.
    pub fn create_or_update(
        &self,
        user_id: &str,
        chat_id: &str,
        fields: ChatFields,
    ) -> Result<Chat> {
        let now = Utc::now();
        let mut chats = self.chats.write();
        let chat = match chats.get_mut(chat_id) {
            Some(existing) => {
                if existing.user_id != user_id {
                    return Err(Error::NotFound(format!("chat {chat_id}")));
                }
                if let Some(title) = fields.title {
                    existing.title = title;
                }
                if let Some(project) = fields.project_id {
                    existing.project_id = project;
                }
                existing.version += 1;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let chat = Chat {
                    id: chat_id.to_owned(),
                    user_id: user_id.to_owned(),
                    title: fields.title.unwrap_or_default(),
                    project_id: fields.project_id.flatten(),
                    messages: Vec::new(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                chats.insert(chat_id.to_owned(), chat.clone());
                chat
            }
        };
        self.flush(&chats);
        Ok(chat)
    }

    pub fn get(&self, user_id: &str, chat_id: &str) -> Result<Chat> {
        self.chats
            .read()
            .get(chat_id)
            .filter(|c| c.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("chat {chat_id}")))
    }

    /// Conditional update: applies `f` only when the stored version equals
    /// `expected_version`, then increments the version by one.
    pub fn update_with_version<F>(
        &self,
        user_id: &str,
        chat_id: &str,
        expected_version: u64,
        f: F,
    ) -> Result<Chat>
    where
        F: FnOnce(&mut Chat),
    {
        let mut chats = self.chats.write();
        let chat = chats
            .get_mut(chat_id)
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("chat {chat_id}")))?;
        if chat.version != expected_version {
            return Err(Error::VersionConflict {
                entity: "chat",
                id: chat_id.to_owned(),
                expected: expected_version,
            });
        }
        f(chat);
        chat.version += 1;
        chat.updated_at = Utc::now();
        let snapshot = chat.clone();
        self.flush(&chats);
        Ok(snapshot)
    }

    pub fn add_message(
        &self,
        user_id: &str,
        chat_id: &str,
        expected_version: u64,
        role: &str,
        content: &str,
    ) -> Result<Chat> {
        let msg = ChatMessage {
            role: role.to_owned(),
            content: content.to_owned(),
            created_at: Utc::now(),
        };
        self.update_with_version(user_id, chat_id, expected_version, |c| {
            c.messages.push(msg);
        })
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Chat> {
        let mut out: Vec<Chat> = self
            .chats
            .read()
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_starts_at_version_one() {
        let store = ChatStore::in_memory();
        let chat = store
            .create_or_update("u1", "c1", ChatFields::default())
            .unwrap();
        assert_eq!(chat.version, 1);
    }

    #[test]
    fn upsert_increments_version() {
        let store = ChatStore::in_memory();
        store.create_or_update("u1", "c1", ChatFields::default()).unwrap();
        let chat = store
            .create_or_update(
                "u1",
                "c1",
                ChatFields {
                    title: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(chat.version, 2);
        assert_eq!(chat.title, "renamed");
    }

    #[test]
    fn version_conflict_on_stale_write() {
        let store = ChatStore::in_memory();
        store.create_or_update("u1", "c1", ChatFields::default()).unwrap();

        // Two writers read version 1. The first succeeds; the second gets
        // a conflict and the store contains exactly one new message.
        store.add_message("u1", "c1", 1, "user", "first").unwrap();
        let err = store.add_message("u1", "c1", 1, "user", "second").unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 1, .. }));

        let chat = store.get("u1", "c1").unwrap();
        assert_eq!(chat.version, 2);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "first");
    }

    #[test]
    fn each_success_increments_by_exactly_one() {
        let store = ChatStore::in_memory();
        store.create_or_update("u1", "c1", ChatFields::default()).unwrap();
        for i in 1..=5u64 {
            let chat = store.add_message("u1", "c1", i, "user", "msg").unwrap();
            assert_eq!(chat.version, i + 1);
        }
    }

    #[test]
    fn project_unset_via_upsert() {
        let store = ChatStore::in_memory();
        store
            .create_or_update(
                "u1",
                "c1",
                ChatFields {
                    project_id: Some(Some("p1".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        let chat = store
            .create_or_update(
                "u1",
                "c1",
                ChatFields {
                    project_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(chat.project_id.is_none());
    }

    #[test]
    fn cross_user_access_denied() {
        let store = ChatStore::in_memory();
        store.create_or_update("u1", "c1", ChatFields::default()).unwrap();
        assert!(store.get("u2", "c1").is_err());
        assert!(store.add_message("u2", "c1", 1, "user", "x").is_err());
    }
}
