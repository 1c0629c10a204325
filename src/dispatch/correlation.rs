//! Correlation table - pending reply waiters keyed by ack key.
//!
//! Flow:
//! 1. The dispatcher calls [`CorrelationTable::register`] and gets a [`PendingReply`]
//! 2. It sends the command with the reply's key in the `AckKey` header
//! 3. The ack listener calls [`CorrelationTable::resolve`] when the reply arrives
//! 4. The dispatcher awaits [`PendingReply::wait`], optionally with a deadline
//!
//! Dropping a [`PendingReply`] evicts its entry, so abandoned waiters do not
//! leak.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::codec::Acknowledgement;
use crate::error::BusError;

/// What a waiter eventually receives.
pub type ReplyOutcome = Result<Acknowledgement, BusError>;

/// Thread-safe map from ack key to a single-fire completion handle.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<DashMap<String, oneshot::Sender<ReplyOutcome>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry under a fresh key, unique among live entries.
    pub fn register(&self) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        loop {
            let key = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.pending.entry(key.clone()) {
                if let Some(tx) = tx.take() {
                    slot.insert(tx);
                }
                return PendingReply {
                    key,
                    receiver: rx,
                    table: self.clone(),
                };
            }
        }
    }

    /// Remove the entry and complete it. Returns `false` when nobody waits
    /// for `key` (already resolved, evicted, or never registered).
    pub fn resolve(&self, key: &str, outcome: ReplyOutcome) -> bool {
        match self.pending.remove(key) {
            Some((_, sender)) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Whether `key` has a live waiter.
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop an entry without completing it.
    pub fn evict(&self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Drop every entry. Waiters observe [`BusError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(count, "cancelled pending replies");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A registered waiter. Evicts its entry when dropped.
pub struct PendingReply {
    key: String,
    receiver: oneshot::Receiver<ReplyOutcome>,
    table: CorrelationTable,
}

impl PendingReply {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the acknowledgement. `topic` only labels a timeout error.
    pub async fn wait(mut self, topic: &str, timeout: Option<Duration>) -> ReplyOutcome {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(BusError::Timeout {
                        topic: topic.to_string(),
                        timeout: limit,
                    })
                }
            },
            None => (&mut self.receiver).await,
        };
        received.map_err(|_| BusError::Cancelled)?
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.evict(&self.key);
    }
}
