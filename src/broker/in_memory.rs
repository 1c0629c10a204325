//! In-memory broker for testing and single-process scenarios.
//!
//! Implements the [`Broker`] contract with:
//! - an append-only log per topic
//! - consumer groups that share one fetch cursor and one committed offset
//! - wakeups through [`Notify`] instead of polling
//! - fault injection for exercising send failures and reconnects
//!
//! ## Example
//!
//! ```
//! # tokio_test_block_on(async {
//! use sourced_bus::broker::{Broker, InMemoryBroker, OffsetReset, OutboundRecord, Subscription};
//! use tokio_util::sync::CancellationToken;
//!
//! let broker = InMemoryBroker::new();
//! broker.create_topic("PlaceOrder").await.unwrap();
//!
//! let producer = broker.producer().await.unwrap();
//! producer
//!     .send(OutboundRecord::new("PlaceOrder", "Body", b"o1".to_vec()))
//!     .await
//!     .unwrap();
//!
//! let mut consumer = broker
//!     .subscribe(Subscription::new("PlaceOrder", "PlaceOrder", OffsetReset::Earliest))
//!     .await
//!     .unwrap();
//! let record = consumer.consume(&CancellationToken::new()).await.unwrap().unwrap();
//! assert_eq!(record.value, b"o1");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Broker, Consumer, DeliveryReceipt, OffsetReset, OutboundRecord, Producer, Record, Subscription};
use crate::error::BrokerError;

/// Thread-safe in-memory broker. Clones share the same topics.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    topics: HashMap<String, TopicLog>,
    available: bool,
    auto_create_topics: bool,
    fail_subscribes: usize,
    fail_sends: usize,
    subscribe_attempts: usize,
}

#[derive(Default)]
struct TopicLog {
    records: Vec<Record>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Next offset handed to any member.
    cursor: u64,
    /// Offset after the last committed record.
    committed: Option<u64>,
    members: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker that auto-creates topics on produce.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    available: true,
                    auto_create_topics: true,
                    fail_subscribes: 0,
                    fail_sends: 0,
                    subscribe_attempts: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Reject sends to missing topics instead of creating them.
    pub fn without_auto_create(self) -> Self {
        self.inner.state.lock().auto_create_topics = false;
        self
    }

    /// Simulate an outage. While unavailable every call fails and open
    /// consumers error out of `consume`.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
        self.inner.notify.notify_waiters();
    }

    /// Fail the next `n` subscribe calls.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.state.lock().fail_subscribes = n;
    }

    /// Reject the next `n` sends.
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.state.lock().fail_sends = n;
    }

    /// Number of subscribe calls seen so far, failed ones included.
    pub fn subscribe_attempts(&self) -> usize {
        self.inner.state.lock().subscribe_attempts
    }

    /// Whether a topic currently exists.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.state.lock().topics.contains_key(topic)
    }

    /// All topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every record ever produced to a topic.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Offset after the last record a group committed on a topic.
    pub fn committed_offset(&self, topic: &str, group_id: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group_id))
            .and_then(|group| group.committed)
    }

    /// Names of the groups that ever subscribed to a topic.
    pub fn groups(&self, topic: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn append(&self, record: OutboundRecord) -> Result<DeliveryReceipt, BrokerError> {
        let receipt = {
            let mut state = self.inner.state.lock();
            if !state.available {
                return Err(BrokerError::Unavailable("in-memory broker offline".into()));
            }
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(BrokerError::SendRejected {
                    topic: record.topic,
                    reason: "injected send failure".into(),
                });
            }
            if !state.topics.contains_key(&record.topic) && !state.auto_create_topics {
                return Err(BrokerError::TopicNotFound(record.topic));
            }

            let log = state.topics.entry(record.topic.clone()).or_default();
            let offset = log.records.len() as u64;
            log.records.push(Record {
                topic: record.topic.clone(),
                offset,
                key: record.key,
                headers: record.headers,
                value: record.value,
            });
            DeliveryReceipt {
                topic: record.topic,
                offset,
            }
        };

        self.inner.notify.notify_waiters();
        Ok(receipt)
    }

    fn check_available(state: &State) -> Result<(), BrokerError> {
        if state.available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker offline".into()))
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        let state = self.inner.state.lock();
        Self::check_available(&state)?;
        Ok(state.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        Self::check_available(&state)?;
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let removed = {
            let mut state = self.inner.state.lock();
            Self::check_available(&state)?;
            state.topics.remove(topic).is_some()
        };
        self.inner.notify.notify_waiters();
        if removed {
            Ok(())
        } else {
            Err(BrokerError::TopicNotFound(topic.to_string()))
        }
    }

    async fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        Self::check_available(&self.inner.state.lock())?;
        Ok(Arc::new(InMemoryProducer {
            broker: self.clone(),
        }))
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.inner.state.lock();
        state.subscribe_attempts += 1;
        Self::check_available(&state)?;
        if state.fail_subscribes > 0 {
            state.fail_subscribes -= 1;
            return Err(BrokerError::Subscribe {
                topic: subscription.topic,
                reason: "injected subscribe failure".into(),
            });
        }

        let log = state
            .topics
            .get_mut(&subscription.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(subscription.topic.clone()))?;
        let end = log.records.len() as u64;
        let group = log.groups.entry(subscription.group_id.clone()).or_default();

        // First member of an idle group resumes from the committed offset,
        // like a rebalance would.
        if group.members == 0 {
            group.cursor = match (group.committed, subscription.offset_reset) {
                (Some(committed), _) => committed,
                (None, OffsetReset::Earliest) => 0,
                (None, OffsetReset::Latest) => end,
            };
        }
        group.members += 1;

        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            topic: subscription.topic,
            group_id: subscription.group_id,
            subscribed: true,
        }))
    }
}

struct InMemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReceipt, BrokerError> {
        self.broker.append(record)
    }
}

struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    subscribed: bool,
}

impl InMemoryConsumer {
    fn try_fetch(&self) -> Result<Option<Record>, BrokerError> {
        if !self.subscribed {
            return Err(BrokerError::Closed);
        }
        let mut state = self.broker.inner.state.lock();
        InMemoryBroker::check_available(&state)?;
        let log = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BrokerError::Consume(format!("topic {} was deleted", self.topic)))?;
        let Some(group) = log.groups.get_mut(&self.group_id) else {
            return Err(BrokerError::Consume(format!("group {} vanished", self.group_id)));
        };

        match log.records.get(group.cursor as usize) {
            Some(record) => {
                group.cursor += 1;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    fn leave(&mut self) {
        if !self.subscribed {
            return;
        }
        self.subscribed = false;
        let mut state = self.broker.inner.state.lock();
        if let Some(group) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group_id))
        {
            group.members = group.members.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<Option<Record>, BrokerError> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a send between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(record) = self.try_fetch()? {
                return Ok(Some(record));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        InMemoryBroker::check_available(&state)?;
        let group = state
            .topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group_id))
            .ok_or_else(|| BrokerError::Commit(format!("no group {} on {}", self.group_id, self.topic)))?;
        let next = record.offset + 1;
        group.committed = Some(group.committed.map_or(next, |c| c.max(next)));
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        self.leave();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.leave();
    }
}
