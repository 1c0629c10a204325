//! Dispatch - the producing side of the bus.
//!
//! ## Request/reply over pub/sub
//!
//! ```text
//!  caller                Dispatcher                 broker               Exchange
//!    │ dispatch_await()      │                         │                     │
//!    │──────────────────────▶│ register ack key        │                     │
//!    │                       │── BodyAck + headers ───▶│── record ──────────▶│
//!    │                       │                         │                     │ handler
//!    │                       │                         │◀── ack (key=ackKey)─│
//!    │                       │◀── AckListener ─────────│                     │
//!    │◀──────── resolve ─────│                         │                     │
//! ```
//!
//! Replies are matched only by ack key, so the order in which they arrive
//! does not matter.

mod ack_listener;
mod correlation;
mod dispatcher;

pub use correlation::{CorrelationTable, PendingReply, ReplyOutcome};
pub use dispatcher::Dispatcher;
