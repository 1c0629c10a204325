//! Broker abstraction - the partitioned pub/sub system the bus runs on.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatcher / Exchanges                       │
//! │  - send records with key + headers                          │
//! │  - consume, commit, unsubscribe                             │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Broker + Producer + Consumer traits             │
//! │  Broker: topics, producer(), subscribe(group)               │
//! │  Producer: send(record) -> receipt                          │
//! │  Consumer: consume(cancel) / commit(record)                 │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌──────────────┐    ┌─────────────┐    ┌─────────────────────┐
//! │InMemoryBroker│    │    Kafka    │    │  Redpanda / others  │
//! │  (included)  │    │ (external)  │    │     (external)      │
//! └──────────────┘    └─────────────┘    └─────────────────────┘
//! ```
//!
//! Offsets are committed manually. Consumers in the same group share the
//! topic (each record goes to one of them); consumers in different groups
//! each see every record.

mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

pub use in_memory::InMemoryBroker;

/// A record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub offset: u64,
    pub key: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub value: Vec<u8>,
}

impl Record {
    /// Raw bytes of the first header with this name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// First header with this name, if it is valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// A record to be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub value: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            headers: Vec::new(),
            value,
        }
    }

    /// Add a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Broker confirmation that a record was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub offset: u64,
}

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// What a consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub group_id: String,
    pub offset_reset: OffsetReset,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>, offset_reset: OffsetReset) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            offset_reset,
        }
    }
}

/// Produces records and confirms persistence.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReceipt, BrokerError>;
}

/// A subscription handle owned by one consumer loop.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next record. Returns `Ok(None)` once `cancel` fires.
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<Option<Record>, BrokerError>;

    /// Commit the group's offset past `record`.
    async fn commit(&mut self, record: &Record) -> Result<(), BrokerError>;

    /// Leave the group. Uncommitted records become available to other members.
    async fn unsubscribe(&mut self) -> Result<(), BrokerError>;
}

/// Administrative and connection surface of a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;

    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Create the topic unless it already exists.
    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.topic_exists(topic).await? {
            self.create_topic(topic).await?;
        }
        Ok(())
    }

    async fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError>;

    async fn subscribe(&self, subscription: Subscription) -> Result<Box<dyn Consumer>, BrokerError>;
}
