//! Error types for the transport.
//!
//! Three layers, matching where a failure originates:
//! - [`BrokerError`] comes from a broker implementation (connect, send, consume).
//! - [`HandlerError`] is returned by business handlers on the consuming side.
//! - [`BusError`] is what callers of the dispatcher and the facade see.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a broker client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The topic does not exist and was not created.
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// The broker refused to persist a record.
    #[error("send rejected on {topic}: {reason}")]
    SendRejected { topic: String, reason: String },

    /// Subscribing a consumer failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Reading from a subscription failed.
    #[error("consume failed: {0}")]
    Consume(String),

    /// Committing an offset failed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// The client was shut down.
    #[error("broker client closed")]
    Closed,
}

/// Error returned from a business handler.
///
/// The bare message (see [`HandlerError::message`]) is what travels back to a
/// waiting dispatcher inside a failed acknowledgement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The caller identity is missing or insufficient.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The handler could not interpret the payload it was given.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Other`].
    pub fn other(message: impl Into<String>) -> Self {
        HandlerError::Other(message.into())
    }

    /// The message without its category prefix.
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Rejected(msg)
            | HandlerError::Unauthorized(msg)
            | HandlerError::DecodeFailed(msg)
            | HandlerError::Other(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Error surfaced by the dispatcher, the exchanges and the bus facade.
#[derive(Debug, Error)]
pub enum BusError {
    /// Connection-level broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker did not confirm persistence of a dispatched message.
    #[error("send to {topic} failed: {reason}")]
    SendFailed { topic: String, reason: String },

    /// The remote handler ran and reported a failure.
    #[error("remote handler failed on {topic}: {message}")]
    RemoteHandler { topic: String, message: String },

    /// No acknowledgement arrived before the reply deadline.
    #[error("no acknowledgement from {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    /// The dispatcher shut down while a caller was waiting for a reply.
    #[error("dispatch cancelled before an acknowledgement arrived")]
    Cancelled,

    /// Encoding or decoding bytes failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Encrypting or decrypting a payload failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// A wire record carried a key other than `Body` or `BodyAck`.
    #[error("unknown wire key: {0:?}")]
    UnknownWireKey(String),

    /// An envelope named a message type nobody registered.
    #[error("message type {0} is not registered")]
    UnregisteredType(String),

    /// Types were registered but no handler was bound for them.
    #[error("no {0} handler bound")]
    HandlersNotSet(&'static str),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BusError {
    /// The remote handler's error text, if this is a [`BusError::RemoteHandler`].
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            BusError::RemoteHandler { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the failure happened on the remote side rather than locally.
    pub fn is_remote(&self) -> bool {
        matches!(self, BusError::RemoteHandler { .. })
    }
}
