//! Change broadcaster — lossy fan-out of coarse "resource changed" events.
//!
//! DESIGN
//! ======
//! Subscribers register a bounded mailbox; `publish` walks the registry with
//! `try_send`. A full mailbox drops the event for that subscriber only, a
//! closed one prunes the subscriber. The publisher never waits, so one slow
//! feed consumer cannot stall tool execution or other subscribers.
//!
//! This is a best-effort notification bus, not an event log — consumers
//! reconcile by re-fetching authoritative state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::now_ms;

/// Mailbox depth per subscriber. Small on purpose: a consumer that falls
/// this far behind should re-fetch rather than replay.
pub const MAILBOX_CAPACITY: usize = 16;

// =============================================================================
// TYPES
// =============================================================================

/// A coarse change notification: which resource kind changed and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Resource kind, e.g. `"budget"`, `"savings_goal"`, `"transaction"`.
    #[serde(rename = "type")]
    pub resource: String,
    /// What happened, e.g. `"created"`, `"updated"`, `"deleted"`.
    pub action: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self { resource: resource.into(), action: action.into(), timestamp: now_ms() }
    }
}

pub type SubscriberId = Uuid;

// =============================================================================
// BROADCASTER
// =============================================================================

#[derive(Clone)]
pub struct ChangeBroadcaster {
    subscribers: Arc<Mutex<HashMap<SubscriberId, mpsc::Sender<ChangeEvent>>>>,
}

impl ChangeBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self { subscribers: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Register a new subscriber with a bounded mailbox.
    #[must_use]
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let id = Uuid::new_v4();
        let total = {
            let mut subs = self.lock();
            subs.insert(id, tx);
            subs.len()
        };
        debug!(subscriber_id = %id, total, "feed: subscriber registered");
        (id, rx)
    }

    /// Remove and close a subscriber's mailbox.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let total = {
            let mut subs = self.lock();
            subs.remove(&id);
            subs.len()
        };
        debug!(subscriber_id = %id, total, "feed: subscriber removed");
    }

    /// Deliver an event to every current subscriber, best-effort. Returns
    /// how many mailboxes accepted it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut closed: Vec<SubscriberId> = Vec::new();

        {
            let subs = self.lock();
            for (id, tx) in subs.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Subscriber mailbox full: drop for this one only.
                        debug!(subscriber_id = %id, "feed: mailbox full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.lock();
            for id in closed {
                subs.remove(&id);
                debug!(subscriber_id = %id, "feed: pruned closed subscriber");
            }
        }

        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<ChangeEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
