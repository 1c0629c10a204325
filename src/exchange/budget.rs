//! Shared receive budget for exchanges of one kind.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Countdown of how many more messages a set of exchanges may accept.
///
/// Cloning shares the counter. An unbounded budget never runs out.
///
/// An exchange reserves its unit before it waits for a message, so every idle
/// exchange sharing the budget holds one unit until a record arrives or it closes.
#[derive(Debug, Clone)]
pub struct ReceiveBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    remaining: Option<AtomicU64>,
    in_flight: AtomicUsize,
}

impl ReceiveBudget {
    pub fn unbounded() -> Self {
        Self::from_limit(None)
    }

    pub fn limited(limit: u64) -> Self {
        Self::from_limit(Some(limit))
    }

    pub fn from_limit(limit: Option<u64>) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                remaining: limit.map(AtomicU64::new),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve one receive. Returns `false` once the budget is exhausted.
    pub fn begin_receive(&self) -> bool {
        let reserved = match &self.inner.remaining {
            None => true,
            Some(remaining) => remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok(),
        };
        if reserved {
            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        reserved
    }

    /// Give back a reservation whose receive never produced a message.
    pub fn cancel_receive(&self) {
        if let Some(remaining) = &self.inner.remaining {
            remaining.fetch_add(1, Ordering::AcqRel);
        }
        self.complete_receive();
    }

    /// Mark a reserved receive as fully processed.
    pub fn complete_receive(&self) {
        let _ = self
            .inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Receives left, `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.inner
            .remaining
            .as_ref()
            .map(|remaining| remaining.load(Ordering::Acquire))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Reserved receives not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

impl Default for ReceiveBudget {
    fn default() -> Self {
        Self::unbounded()
    }
}
