//! Exchanges - the consuming side of the bus.
//!
//! One [`Exchange`] per registered message type. Each runs a loop that:
//! - takes a slot from its concurrency throttle
//! - reserves one receive from the shared [`ReceiveBudget`]
//! - reads one record and commits it immediately
//! - hands the record to a spawned task and goes back for the next one
//!
//! The spawned task decodes the envelope, installs the caller identity,
//! invokes the bound handler and, if the sender asked for it, produces an
//! acknowledgement to the sender's reply topic.
//!
//! Connection errors move the exchange to `Backoff`; it reopens after the
//! [`RetryPolicy`] delay until closed.

mod budget;
mod handlers;
mod retry;
mod runner;

pub use budget::ReceiveBudget;
pub use handlers::{CallContext, CommandHandlers, EventHandler, ExchangeHandlers, HandlerFuture};
pub use retry::RetryPolicy;
pub use runner::{Exchange, ExchangeSettings, ExchangeState, ExchangeStats};
