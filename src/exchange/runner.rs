//! One consumer loop per registered message type.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::budget::ReceiveBudget;
use super::handlers::{CallContext, ExchangeHandlers};
use super::retry::RetryPolicy;
use crate::broker::{Broker, Consumer, OffsetReset, OutboundRecord, Producer, Record, Subscription};
use crate::codec::{
    Acknowledgement, DispatchMode, Envelope, WireCodec, WireKey, ACK_KEY_HEADER, ACK_TOPIC_HEADER,
};
use crate::error::{BrokerError, BusError, HandlerError};
use crate::identity;
use crate::message::{MessageKind, MessageType};

/// Lifecycle of an exchange.
///
/// ```text
/// Closed ─open─▶ Opening ──▶ Listening ─close─▶ Draining ──▶ Closed
///                   ▲            │
///                   └─ Backoff ◀─┘ (connection error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Closed,
    Opening,
    Listening,
    Backoff,
    Draining,
}

/// Counters from an exchange, read with [`Exchange::stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Messages fetched and committed.
    pub received: u64,
    /// Handler invocations that succeeded.
    pub handled: u64,
    /// Handler invocations that returned an error.
    pub failed: u64,
    /// Messages dropped before reaching a handler.
    pub dropped: u64,
    /// Acknowledgements produced.
    pub acks_sent: u64,
    /// Reconnect attempts after a connection error.
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    acks_sent: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExchangeStats {
        ExchangeStats {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Tuning shared by the exchanges of one kind.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub concurrency: usize,
    pub budget: ReceiveBudget,
    pub retry: RetryPolicy,
    pub idle_poll: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            budget: ReceiveBudget::unbounded(),
            retry: RetryPolicy::default(),
            idle_poll: Duration::from_millis(50),
        }
    }
}

/// A message type's consumer loop and the resources bound to it.
///
/// Commands join the group named after the topic, so same-named consumers
/// share the work. Events join a fresh group per exchange, so every
/// subscriber sees every event.
pub struct Exchange {
    core: Arc<Core>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<ExchangeState>,
}

struct Core {
    broker: Arc<dyn Broker>,
    codec: WireCodec,
    message_type: MessageType,
    topic: String,
    group_id: String,
    offset_reset: OffsetReset,
    handlers: ExchangeHandlers,
    concurrency: u32,
    throttle: Arc<Semaphore>,
    budget: ReceiveBudget,
    retry: RetryPolicy,
    idle_poll: Duration,
    reply_producer: Mutex<Option<Arc<dyn Producer>>>,
    counters: Counters,
    state: watch::Sender<ExchangeState>,
}

impl Exchange {
    pub fn new(
        broker: Arc<dyn Broker>,
        codec: WireCodec,
        message_type: MessageType,
        topic: impl Into<String>,
        handlers: impl Into<ExchangeHandlers>,
        settings: ExchangeSettings,
    ) -> Self {
        let topic = topic.into();
        let (group_id, offset_reset) = match message_type.kind() {
            MessageKind::Command => (topic.clone(), OffsetReset::Earliest),
            MessageKind::Event => (Uuid::new_v4().to_string(), OffsetReset::Latest),
        };
        let concurrency = u32::try_from(settings.concurrency.max(1)).unwrap_or(u32::MAX);
        let (state_tx, state_rx) = watch::channel(ExchangeState::Closed);

        Self {
            core: Arc::new(Core {
                broker,
                codec,
                message_type,
                topic,
                group_id,
                offset_reset,
                handlers: handlers.into(),
                concurrency,
                throttle: Arc::new(Semaphore::new(concurrency as usize)),
                budget: settings.budget,
                retry: settings.retry,
                idle_poll: settings.idle_poll,
                reply_producer: Mutex::new(None),
                counters: Counters::default(),
                state: state_tx,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            state: state_rx,
        }
    }

    /// Start the consumer loop. No-op if already running or closed.
    pub fn open(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let core = self.core.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(core.run(cancel)));
    }

    /// Stop reading, wait for in-flight handlers, release the subscription.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(topic = %self.core.topic, error = %err, "exchange task ended abnormally");
                self.core.state.send_replace(ExchangeState::Closed);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.task.lock().is_some() && !self.cancel.is_cancelled()
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn group_id(&self) -> &str {
        &self.core.group_id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.core.message_type
    }

    pub fn state(&self) -> ExchangeState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ExchangeState> {
        self.state.clone()
    }

    /// Wait until the exchange reaches `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: ExchangeState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn stats(&self) -> ExchangeStats {
        self.core.counters.snapshot()
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("message_type", &self.core.message_type.name())
            .field("topic", &self.core.topic)
            .field("group_id", &self.core.group_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Holds a throttle slot and a budget reservation until processing ends,
/// even if the handler panics.
struct InFlight {
    _permit: OwnedSemaphorePermit,
    budget: ReceiveBudget,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.budget.complete_receive();
    }
}

impl Core {
    fn set_state(&self, state: ExchangeState) {
        self.state.send_replace(state);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt = 0u32;
        while !cancel.is_cancelled() {
            self.set_state(ExchangeState::Opening);
            match self.listen(&cancel, &mut attempt).await {
                Ok(()) => break,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    Counters::bump(&self.counters.reconnects);
                    warn!(
                        topic = %self.topic,
                        error = %err,
                        attempt,
                        "exchange connection failed, reopening after delay"
                    );
                    self.set_state(ExchangeState::Backoff);
                    if !self.retry.allows(attempt) || !self.retry.wait(attempt, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ExchangeState::Draining);
        // Every slot back means every in-flight handler finished.
        if let Ok(all) = self.throttle.acquire_many(self.concurrency).await {
            drop(all);
        }
        info!(topic = %self.topic, "exchange closed");
        self.set_state(ExchangeState::Closed);
    }

    async fn listen(self: &Arc<Self>, cancel: &CancellationToken, attempt: &mut u32) -> Result<(), BrokerError> {
        self.broker.ensure_topic(&self.topic).await?;
        let mut consumer = self
            .broker
            .subscribe(Subscription::new(&self.topic, &self.group_id, self.offset_reset))
            .await?;

        *attempt = 0;
        self.set_state(ExchangeState::Listening);
        info!(
            topic = %self.topic,
            group_id = %self.group_id,
            kind = %self.message_type.kind(),
            "exchange listening"
        );

        let result = self.receive(consumer.as_mut(), cancel).await;
        if let Err(err) = consumer.unsubscribe().await {
            debug!(topic = %self.topic, error = %err, "unsubscribe failed");
        }
        result
    }

    async fn receive(self: &Arc<Self>, consumer: &mut dyn Consumer, cancel: &CancellationToken) -> Result<(), BrokerError> {
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                permit = self.throttle.clone().acquire_owned() => permit.map_err(|_| BrokerError::Closed)?,
            };

            if !self.budget.begin_receive() {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.idle_poll) => continue,
                }
            }

            let record = match consumer.consume(cancel).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.budget.cancel_receive();
                    return Ok(());
                }
                Err(err) => {
                    self.budget.cancel_receive();
                    return Err(err);
                }
            };

            // Committed before the handler runs: a crash mid-handler loses
            // the message instead of redelivering it.
            if let Err(err) = consumer.commit(&record).await {
                self.budget.cancel_receive();
                return Err(err);
            }
            Counters::bump(&self.counters.received);

            let in_flight = InFlight {
                _permit: permit,
                budget: self.budget.clone(),
            };
            let core = self.clone();
            tokio::spawn(async move {
                core.process(record).await;
                drop(in_flight);
            });
        }
    }

    async fn process(&self, record: Record) {
        let key = match record.key.as_deref().map(WireKey::parse) {
            Some(Ok(key)) => key,
            Some(Err(err)) => return self.drop_record(&record, &err),
            None => return self.drop_record(&record, &BusError::UnknownWireKey(String::new())),
        };
        let envelope: Envelope = match self.codec.decode(&record.value) {
            Ok(envelope) => envelope,
            Err(err) => return self.drop_record(&record, &err),
        };
        let payload = match self.message_type.decode(
            &envelope.message_type,
            self.codec.serializer(),
            &envelope.payload,
        ) {
            Ok(payload) => payload,
            Err(err) => return self.drop_record(&record, &err),
        };

        let reply_to = if key.wants_reply() {
            match (record.header_str(ACK_TOPIC_HEADER), record.header_str(ACK_KEY_HEADER)) {
                (Some(topic), Some(ack_key)) => Some((topic.to_string(), ack_key.to_string())),
                _ => {
                    warn!(topic = %self.topic, offset = record.offset, "reply requested without reply headers");
                    None
                }
            }
        } else {
            None
        };

        let mode = match (key, envelope.mode) {
            (WireKey::Body, _) => DispatchMode::FireAndForget,
            (WireKey::BodyAck, DispatchMode::FireAndForget) => DispatchMode::AwaitHandlerCompletion,
            (WireKey::BodyAck, mode) => mode,
        };
        let identity = envelope.identity();
        let ctx = CallContext {
            identity: identity.clone(),
            source_service: envelope.source_service,
            message_type: self.message_type.name(),
            topic: self.topic.clone(),
            mode,
        };

        let invocation = AssertUnwindSafe(self.handlers.invoke(payload, ctx)).catch_unwind();
        let outcome = match identity::scope(identity, invocation).await {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::other(panic_message(panic.as_ref()))),
        };
        match &outcome {
            Ok(_) => Counters::bump(&self.counters.handled),
            Err(err) => {
                Counters::bump(&self.counters.failed);
                if reply_to.is_none() {
                    warn!(
                        topic = %self.topic,
                        offset = record.offset,
                        error = %err,
                        "handler failed"
                    );
                }
            }
        }

        if let Some((reply_topic, ack_key)) = reply_to {
            self.reply(&reply_topic, &ack_key, mode, outcome).await;
        }
    }

    fn drop_record(&self, record: &Record, err: &BusError) {
        Counters::bump(&self.counters.dropped);
        warn!(
            topic = %self.topic,
            offset = record.offset,
            error = %err,
            "dropping undecodable message"
        );
    }

    async fn reply(
        &self,
        reply_topic: &str,
        ack_key: &str,
        mode: DispatchMode,
        outcome: Result<Option<Value>, HandlerError>,
    ) {
        let ack = match outcome {
            Ok(Some(value)) if mode == DispatchMode::AwaitHandlerResult => {
                Acknowledgement::with_result(&value)
                    .unwrap_or_else(|err| Acknowledgement::failed(err.to_string()))
            }
            Ok(_) => Acknowledgement::ok(),
            Err(err) => Acknowledgement::failed(err.message()),
        };

        if let Err(err) = self.send_ack(reply_topic, ack_key, &ack).await {
            warn!(
                topic = %self.topic,
                reply_topic = %reply_topic,
                ack_key = %ack_key,
                error = %err,
                "failed to send acknowledgement"
            );
            return;
        }
        Counters::bump(&self.counters.acks_sent);
        debug!(topic = %self.topic, ack_key = %ack_key, success = ack.success, "acknowledgement sent");
    }

    async fn send_ack(&self, reply_topic: &str, ack_key: &str, ack: &Acknowledgement) -> Result<(), BusError> {
        let value = self.codec.encode(ack)?;
        let producer = self.reply_producer().await?;
        if let Err(err) = producer.send(OutboundRecord::new(reply_topic, ack_key, value)).await {
            // Reopen on the next reply.
            self.reply_producer.lock().take();
            return Err(err.into());
        }
        Ok(())
    }

    async fn reply_producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        let cached = self.reply_producer.lock().clone();
        if let Some(producer) = cached {
            return Ok(producer);
        }
        let producer = self.broker.producer().await?;
        Ok(self.reply_producer.lock().get_or_insert(producer).clone())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
