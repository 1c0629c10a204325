//! Reconnect policy shared by exchanges and the ack listener.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How long to wait before reopening a failed connection.
///
/// Only the fixed-delay, unbounded policy exists: every attempt waits the same
/// delay and retries never stop until the owner cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Whether retry number `attempt` is allowed at all.
    pub fn allows(&self, _attempt: u32) -> bool {
        true
    }

    /// Sleep before `attempt`. Returns `false` if cancelled first.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay_for(attempt)) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
