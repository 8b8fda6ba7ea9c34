//! API keys: generation, digest-at-rest storage, constant-time
//! verification, and scope attachment.
//!
//! Key material is `clv_` + 64 lowercase hex chars. The plaintext is
//! returned exactly once at creation; only a SHA-256 digest and a short
//! display prefix are stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cortex_domain::error::{Error, Result};
use cortex_domain::scope;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: String,
    /// Display prefix (`clv_` + first 8 hex chars).
    pub key_prefix: String,
    /// Hex SHA-256 digest of the full key.
    pub hash: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn has_execute_scope(&self, agent_id: &str) -> bool {
        scope::has_execute_scope(&self.scopes, agent_id)
    }

    pub fn has_read_scope(&self, resource: &str) -> bool {
        scope::has_read_scope(&self.scopes, resource)
    }
}

pub struct ApiKeyStore {
    path: Option<PathBuf>,
    keys: RwLock<HashMap<Uuid, ApiKeyRecord>>,
}

fn digest_hex(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl ApiKeyStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "api_keys.json");
        let keys = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            keys: RwLock::new(keys),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, keys: &HashMap<Uuid, ApiKeyRecord>) {
        if let Some(path) = &self.path {
            persist::save(path, keys);
        }
    }

    /// Mint a key. Returns the plaintext (shown once) and the stored record.
    pub fn create(&self, user_id: &str, scopes: Vec<String>) -> Result<(String, ApiKeyRecord)> {
        if scopes.is_empty() {
            return Err(Error::Validation("at least one scope is required".into()));
        }
        for s in &scopes {
            if !scope::is_valid_scope(s) {
                return Err(Error::Validation(format!("invalid scope: {s}")));
            }
        }
        // 64 hex chars of v4-uuid randomness.
        let material = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let key = format!("{}{material}", scope::KEY_PREFIX);
        debug_assert!(scope::is_valid_key_format(&key));

        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            key_prefix: key[..scope::KEY_PREFIX.len() + 8].to_owned(),
            hash: digest_hex(&key),
            scopes,
            created_at: Utc::now(),
            revoked: false,
            last_used_at: None,
        };

        let mut keys = self.keys.write();
        keys.insert(record.id, record.clone());
        self.flush(&keys);
        Ok((key, record))
    }

    /// Verify a presented key. The stored digest is compared against the
    /// digest of the plaintext in constant time; records are scanned
    /// unconditionally so timing does not reveal which prefix matched.
    pub fn verify(&self, presented: &str) -> Option<ApiKeyRecord> {
        if !scope::is_valid_key_format(presented) {
            return None;
        }
        let presented_digest = Sha256::digest(presented.as_bytes());

        let mut matched: Option<Uuid> = None;
        {
            let keys = self.keys.read();
            for record in keys.values() {
                let Ok(stored) = hex::decode(&record.hash) else {
                    continue;
                };
                let equal = bool::from(presented_digest.ct_eq(stored.as_slice()));
                if equal && !record.revoked {
                    matched = Some(record.id);
                }
            }
        }

        let id = matched?;
        let mut keys = self.keys.write();
        let record = keys.get_mut(&id)?;
        record.last_used_at = Some(Utc::now());
        let snapshot = record.clone();
        self.flush(&keys);
        Some(snapshot)
    }

    pub fn revoke(&self, user_id: &str, id: &Uuid) -> Result<()> {
        let mut keys = self.keys.write();
        let record = keys
            .get_mut(id)
            .filter(|k| k.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("api key {id}")))?;
        record.revoked = true;
        self.flush(&keys);
        Ok(())
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<ApiKeyRecord> {
        self.keys
            .read()
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_key_has_canonical_format() {
        let store = ApiKeyStore::in_memory();
        let (key, record) = store.create("u1", vec!["*".into()]).unwrap();
        assert!(scope::is_valid_key_format(&key));
        assert!(key.starts_with(&record.key_prefix));
        assert_ne!(record.hash, key);
    }

    #[test]
    fn verify_accepts_only_the_minted_key() {
        let store = ApiKeyStore::in_memory();
        let (key, record) = store.create("u1", vec!["read:executions".into()]).unwrap();
        let found = store.verify(&key).unwrap();
        assert_eq!(found.id, record.id);
        assert!(found.last_used_at.is_some());

        // Same shape, different material.
        let other = format!("clv_{}", "0".repeat(64));
        assert!(store.verify(&other).is_none());
        assert!(store.verify("not-a-key").is_none());
    }

    #[test]
    fn revoked_keys_fail_verification() {
        let store = ApiKeyStore::in_memory();
        let (key, record) = store.create("u1", vec!["*".into()]).unwrap();
        store.revoke("u1", &record.id).unwrap();
        assert!(store.verify(&key).is_none());
    }

    #[test]
    fn scope_checks_follow_the_grammar() {
        let store = ApiKeyStore::in_memory();
        let (_, record) = store
            .create("u1", vec!["execute:alpha".into(), "read:executions".into()])
            .unwrap();
        assert!(record.has_execute_scope("alpha"));
        assert!(!record.has_execute_scope("beta"));
        assert!(record.has_read_scope("executions"));
        assert!(!record.has_read_scope("models"));
    }

    #[test]
    fn invalid_scopes_are_rejected_at_creation() {
        let store = ApiKeyStore::in_memory();
        assert!(store.create("u1", vec![]).is_err());
        assert!(store.create("u1", vec!["write:*".into()]).is_err());
    }
}
