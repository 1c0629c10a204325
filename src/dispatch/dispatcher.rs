//! Producer side of the bus.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ack_listener::AckListener;
use super::correlation::CorrelationTable;
use crate::broker::{Broker, OutboundRecord, Producer};
use crate::codec::{Acknowledgement, DispatchMode, Envelope, WireCodec, ACK_KEY_HEADER, ACK_TOPIC_HEADER};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::exchange::RetryPolicy;
use crate::identity;
use crate::message::{Command, Event, Message};
use crate::topic::{reply_topic_name, topic_name};

/// Sends commands and events, and waits for acknowledgements when asked to.
///
/// Cheap to clone; clones share the producer, the reply topic and the
/// pending replies.
///
/// ## Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(Arc::new(broker), &config)?;
///
/// // Returns once the broker has the message.
/// dispatcher.dispatch_fire_and_forget(&PlaceOrder { id: "o1".into() }).await?;
///
/// // Returns once the remote handler finished, or with its error.
/// dispatcher.dispatch_await(&PlaceOrder { id: "o2".into() }).await?;
///
/// // Returns the remote handler's result.
/// let total: OrderTotal = dispatcher
///     .dispatch_await_with_result(&PriceOrder { id: "o2".into() })
///     .await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    codec: WireCodec,
    environment: Option<String>,
    service_name: Option<String>,
    max_topic_length: usize,
    reply_topic: String,
    reply_timeout: Option<Duration>,
    retry: RetryPolicy,
    correlations: CorrelationTable,
    producer: OnceCell<Arc<dyn Producer>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Dispatcher {
    /// Build a dispatcher, validating the config and its encryption key.
    pub fn new(broker: Arc<dyn Broker>, config: &BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let codec = WireCodec::from_config(config)?;
        Ok(Self::with_codec(broker, config, codec))
    }

    /// Build a dispatcher around an existing codec.
    pub fn with_codec(broker: Arc<dyn Broker>, config: &BusConfig, codec: WireCodec) -> Self {
        let reply_topic = reply_topic_name(
            config.service_name(),
            config.environment(),
            config.max_topic_length,
        );
        Self {
            inner: Arc::new(Inner {
                broker,
                codec,
                environment: config.environment.clone(),
                service_name: config.service_name.clone(),
                max_topic_length: config.max_topic_length,
                reply_topic,
                reply_timeout: config.reply_timeout(),
                retry: RetryPolicy::fixed(config.retry_delay()),
                correlations: CorrelationTable::new(),
                producer: OnceCell::new(),
                listener: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Topic a message type is sent to.
    pub fn topic_for<M: Message>(&self) -> String {
        topic_name(
            M::TYPE_NAME,
            self.inner.environment.as_deref(),
            self.inner.max_topic_length,
        )
    }

    /// This instance's private reply topic.
    pub fn reply_topic(&self) -> &str {
        &self.inner.reply_topic
    }

    /// Waiters still expecting an acknowledgement.
    pub fn pending_replies(&self) -> usize {
        self.inner.correlations.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Send a command without asking for a reply.
    pub async fn dispatch_fire_and_forget<C: Command>(&self, command: &C) -> Result<(), BusError> {
        self.send_one_way(command).await
    }

    /// Broadcast an event.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), BusError> {
        self.send_one_way(event).await
    }

    /// Send a command and wait until its handler finished, using the
    /// configured reply timeout.
    pub async fn dispatch_await<C: Command>(&self, command: &C) -> Result<(), BusError> {
        self.request(command, DispatchMode::AwaitHandlerCompletion, self.inner.reply_timeout)
            .await
            .map(|_| ())
    }

    /// [`Dispatcher::dispatch_await`] with an explicit deadline.
    pub async fn dispatch_await_within<C: Command>(&self, command: &C, timeout: Duration) -> Result<(), BusError> {
        self.request(command, DispatchMode::AwaitHandlerCompletion, Some(timeout))
            .await
            .map(|_| ())
    }

    /// Send a command and return its handler's result decoded as `R`.
    pub async fn dispatch_await_with_result<C, R>(&self, command: &C) -> Result<R, BusError>
    where
        C: Command,
        R: DeserializeOwned,
    {
        self.request(command, DispatchMode::AwaitHandlerResult, self.inner.reply_timeout)
            .await?
            .decode_result()
    }

    /// [`Dispatcher::dispatch_await_with_result`] with an explicit deadline.
    pub async fn dispatch_await_with_result_within<C, R>(&self, command: &C, timeout: Duration) -> Result<R, BusError>
    where
        C: Command,
        R: DeserializeOwned,
    {
        self.request(command, DispatchMode::AwaitHandlerResult, Some(timeout))
            .await?
            .decode_result()
    }

    /// Stop the ack listener, fail every pending waiter with
    /// [`BusError::Cancelled`] and remove the reply topic.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let listener = self.inner.listener.lock().await.take();
        if let Some(listener) = listener {
            if let Err(err) = listener.await {
                warn!(reply_topic = %self.inner.reply_topic, error = %err, "ack listener ended abnormally");
            }
        }
        let cancelled = self.inner.correlations.cancel_all();
        info!(reply_topic = %self.inner.reply_topic, cancelled, "dispatcher shut down");
    }

    async fn send_one_way<M: Message>(&self, message: &M) -> Result<(), BusError> {
        let topic = self.topic_for::<M>();
        let mode = DispatchMode::FireAndForget;
        let value = self.envelope(message, mode)?;
        self.send(OutboundRecord::new(&topic, mode.wire_key().as_str(), value))
            .await?;
        debug!(topic = %topic, message_type = M::TYPE_NAME, "dispatched");
        Ok(())
    }

    async fn request<C: Command>(
        &self,
        command: &C,
        mode: DispatchMode,
        timeout: Option<Duration>,
    ) -> Result<Acknowledgement, BusError> {
        self.ensure_ack_listener().await?;

        let topic = self.topic_for::<C>();
        let value = self.envelope(command, mode)?;
        let reply = self.inner.correlations.register();
        let record = OutboundRecord::new(&topic, mode.wire_key().as_str(), value)
            .with_header(ACK_TOPIC_HEADER, self.inner.reply_topic.as_str())
            .with_header(ACK_KEY_HEADER, reply.key());

        // A failed send drops `reply`, which evicts its entry.
        self.send(record).await?;
        debug!(topic = %topic, ack_key = %reply.key(), "dispatched, awaiting acknowledgement");

        reply.wait(&topic, timeout).await?.into_result(&topic)
    }

    fn envelope<M: Message>(&self, message: &M, mode: DispatchMode) -> Result<Vec<u8>, BusError> {
        let payload = self.inner.codec.serializer().serialize(message)?;
        let caller = identity::current();
        let envelope = Envelope::new(M::TYPE_NAME, payload, mode)
            .with_identity(caller.as_ref())
            .with_source(self.inner.service_name.as_deref());
        self.inner.codec.encode(&envelope)
    }

    async fn send(&self, record: OutboundRecord) -> Result<(), BusError> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let topic = record.topic.clone();
        let producer = self
            .inner
            .producer
            .get_or_try_init(|| self.inner.broker.producer())
            .await
            .map_err(|err| BusError::SendFailed {
                topic: topic.clone(),
                reason: err.to_string(),
            })?;
        producer
            .send(record)
            .await
            .map(|_| ())
            .map_err(|err| BusError::SendFailed {
                topic,
                reason: err.to_string(),
            })
    }

    async fn ensure_ack_listener(&self) -> Result<(), BusError> {
        let mut listener = self.inner.listener.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        if listener.is_none() {
            // Created up front so a reply can never race the topic into existence.
            self.inner.broker.ensure_topic(&self.inner.reply_topic).await?;
            *listener = Some(
                AckListener {
                    broker: self.inner.broker.clone(),
                    codec: self.inner.codec.clone(),
                    reply_topic: self.inner.reply_topic.clone(),
                    correlations: self.inner.correlations.clone(),
                    retry: self.inner.retry,
                    cancel: self.inner.cancel.clone(),
                }
                .spawn(),
            );
            debug!(reply_topic = %self.inner.reply_topic, "ack listener started");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("reply_topic", &self.inner.reply_topic)
            .field("service_name", &self.inner.service_name)
            .field("pending_replies", &self.pending_replies())
            .finish()
    }
}
