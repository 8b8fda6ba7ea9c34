//! DaemonPool: per-user admission slots and in-memory cancel handles.
//!
//! The pool exclusively owns the cancel handles for running daemon
//! workers; the durable daemon record lives in the
//! [`cortex_stores::DaemonStore`]. Admission is a per-user semaphore —
//! acquiring fails immediately (no queueing) when the user's slots are
//! exhausted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cortex_domain::error::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Cooperative cancellation flag checked by the daemon worker at every
/// LLM and tool boundary.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct DaemonPool {
    max_per_user: u32,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    runners: Mutex<HashMap<Uuid, CancelToken>>,
}

impl DaemonPool {
    pub fn new(max_per_user: u32) -> Self {
        Self {
            max_per_user: max_per_user.max(1),
            slots: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, user_id: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock();
        slots
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_user as usize)))
            .clone()
    }

    /// Claim one daemon slot for the user, or fail with a structured
    /// capacity error. The permit releases the slot on drop.
    pub fn try_acquire_slot(&self, user_id: &str) -> Result<OwnedSemaphorePermit> {
        let sem = self.semaphore(user_id);
        let available = sem.available_permits() as u32;
        sem.try_acquire_owned().map_err(|_| Error::CapacityExceeded {
            limit: self.max_per_user,
            used: self.max_per_user - available,
        })
    }

    /// Slots currently in use for a user.
    pub fn slots_in_use(&self, user_id: &str) -> u32 {
        let sem = self.semaphore(user_id);
        self.max_per_user - sem.available_permits() as u32
    }

    pub fn max_per_user(&self) -> u32 {
        self.max_per_user
    }

    // ── Runner handles ──────────────────────────────────────────────

    /// Register a cancel handle for a launching daemon worker.
    pub fn register_runner(&self, daemon_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.runners.lock().insert(daemon_id, token.clone());
        token
    }

    /// Request cooperative cancellation. Returns whether a runner was
    /// registered.
    pub fn cancel(&self, daemon_id: &Uuid) -> bool {
        match self.runners.lock().get(daemon_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the handle once the worker has written its terminal record.
    pub fn remove_runner(&self, daemon_id: &Uuid) {
        self.runners.lock().remove(daemon_id);
    }

    pub fn running_count(&self) -> usize {
        self.runners.lock().len()
    }
}
