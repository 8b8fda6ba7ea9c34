//! Per-user event bus.
//!
//! Fan-out of typed events to any number of observers per user. Delivery
//! is strictly non-blocking: a subscriber whose buffer is full loses that
//! event and its `dropped` counter increments; publishers never wait.
//! Events published for one user reach each subscriber in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cortex_domain::event::CortexEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Subscriber {
    tx: mpsc::Sender<CortexEvent>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
pub struct EventBus {
    /// user_id -> subscriber_id -> delivery channel.
    subscribers: Mutex<HashMap<String, HashMap<String, Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bounded delivery channel for `(user, subscriber)`. An
    /// existing subscription under the same id is replaced (its channel
    /// closes).
    pub fn subscribe(
        &self,
        user_id: &str,
        subscriber_id: &str,
        buffer: usize,
    ) -> mpsc::Receiver<CortexEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut subs = self.subscribers.lock();
        subs.entry(user_id.to_owned()).or_default().insert(
            subscriber_id.to_owned(),
            Subscriber {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        rx
    }

    /// Close the subscriber's channel. Subsequent publishes to it are
    /// no-ops.
    pub fn unsubscribe(&self, user_id: &str, subscriber_id: &str) {
        let mut subs = self.subscribers.lock();
        if let Some(user_subs) = subs.get_mut(user_id) {
            user_subs.remove(subscriber_id);
            if user_subs.is_empty() {
                subs.remove(user_id);
            }
        }
    }

    /// Deliver an event to every subscriber of `user_id`. Returns how many
    /// subscribers received it.
    pub fn publish(&self, user_id: &str, event: CortexEvent) -> usize {
        let mut subs = self.subscribers.lock();
        let Some(user_subs) = subs.get_mut(user_id) else {
            return 0;
        };
        let mut delivered = 0usize;
        user_subs.retain(|subscriber_id, sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(user_id, subscriber_id, "subscriber buffer full, event dropped");
                    true
                }
                // Receiver gone: prune the subscription.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if user_subs.is_empty() {
            subs.remove(user_id);
        }
        delivered
    }

    /// Events lost to a full buffer for one subscriber.
    pub fn dropped_count(&self, user_id: &str, subscriber_id: &str) -> u64 {
        self.subscribers
            .lock()
            .get(user_id)
            .and_then(|m| m.get(subscriber_id))
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(user_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
