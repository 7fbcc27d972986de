//! Fan-out of scan progress snapshots to push subscribers (WebSocket clients).
//!
//! Every subscriber owns an unbounded queue, so `publish` never waits on a
//! slow client. A subscriber whose receiver has gone away is dropped on the
//! next publish without affecting delivery to anyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::types::ProgressEvent;

/// Opaque subscriber id returned by [`ProgressChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
pub struct ProgressChannel {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<ProgressEvent>>>,
    next_id: AtomicU64,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::UnboundedSender<ProgressEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<ProgressEvent>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        tracing::debug!(subscriber = %id, "Progress subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.lock().remove(&id).is_some() {
            tracing::debug!(subscriber = %id, "Progress subscriber removed");
        }
    }

    /// Deliver `event` to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        // Copy out the senders so the map is never mutated while iterated
        // and the lock is not held during delivery.
        let targets: Vec<(SubscriberId, mpsc::UnboundedSender<ProgressEvent>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in &targets {
            if tx.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let mut subs = self.lock();
            for id in &dead {
                subs.remove(id);
                tracing::debug!(subscriber = %id, "Dropped closed progress subscriber");
            }
        }

        targets.len() - dead.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}
