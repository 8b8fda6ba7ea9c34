//! Shared key/value cache contract.
//!
//! The production deployment points this at a networked cache; the
//! in-process [`MemoryCache`] implements the same contract for the single
//! binary and for tests. The orchestrator depends only on the trait.

pub mod memory;

use std::time::Duration;

use cortex_domain::Result;
use tokio::sync::mpsc;

pub use memory::MemoryCache;

/// Pub/sub channel names shared with out-of-process observers. These are
/// part of the cache wire contract; renaming them breaks deployed
/// listeners.
pub mod channels {
    pub fn user_events(user_id: &str) -> String {
        format!("user:{user_id}:events")
    }

    pub fn agent_events(agent_id: &str) -> String {
        format!("agent:{agent_id}:events")
    }

    pub fn broadcast(topic: &str) -> String {
        format!("broadcast:{topic}")
    }

}

/// Key/value store with atomic counters, sets, TTLs, distributed locks,
/// and pub/sub channels.
#[async_trait::async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically add `by` to the integer at `key` (missing = 0) and return
    /// the new value.
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Reset the TTL of an existing key. No-op when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Add members to the set at `key`, optionally refreshing its TTL.
    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()>;

    /// All members of the set at `key` (empty when missing or expired).
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Acquire the lock `key` for `owner` with a TTL. Returns `true` when
    /// acquired, `false` when another owner holds it.
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its current value equals `owner`. Returns
    /// whether a delete happened. This is the only safe lock release.
    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool>;

    /// Publish a payload to a channel; returns the number of subscribers
    /// that received it. Never blocks the publisher.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribe to a channel with a bounded delivery buffer.
    async fn subscribe(&self, channel: &str, buffer: usize) -> Result<mpsc::Receiver<String>>;
}
