//! In-process [`SharedCache`] implementation.
//!
//! Entries expire lazily: a read that finds a past-deadline entry removes
//! it. Pub/sub delivery is non-blocking; a subscriber whose buffer is full
//! misses that message.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use cortex_domain::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

enum Value {
    Str(String),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry, evicting it first when expired.
    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    /// Number of live entries (test/diagnostic helper).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl super::SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key, now).and_then(|e| match &e.value {
            Value::Str(s) => Some(s.clone()),
            Value::Set(_) => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key, now) {
            Some(entry) => match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| Error::Validation(format!("{key} is not an integer")))?;
                    let next = current + by;
                    *s = next.to_string();
                    Ok(next)
                }
                Value::Set(_) => Err(Error::Validation(format!("{key} holds a set"))),
            },
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: Value::Str(by.to_string()),
                        expires_at: None,
                    },
                );
                Ok(by)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = Self::live(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key, now) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => {
                    set.extend(members.iter().cloned());
                    if let Some(d) = ttl {
                        entry.expires_at = Some(now + d);
                    }
                    Ok(())
                }
                Value::Str(_) => Err(Error::Validation(format!("{key} holds a string"))),
            },
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: Value::Set(members.iter().cloned().collect()),
                        expires_at: ttl.map(|d| now + d),
                    },
                );
                Ok(())
            }
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key, now)
            .map(|e| match &e.value {
                Value::Set(set) => {
                    let mut v: Vec<String> = set.iter().cloned().collect();
                    v.sort();
                    v
                }
                Value::Str(_) => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(owner.to_owned()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = matches!(
            Self::live(&mut entries, key, now).map(|e| &e.value),
            Some(Value::Str(s)) if s.as_str() == owner
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut channels = self.channels.lock();
        let Some(senders) = channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0usize;
        for tx in senders.iter() {
            match tx.try_send(payload.to_owned()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(channel, "subscriber buffer full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if senders.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str, buffer: usize) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.channels
            .lock()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
