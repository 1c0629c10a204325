//! Bus facade - registration, handler binding and exchange lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::broker::Broker;
use crate::codec::WireCodec;
use crate::config::BusConfig;
use crate::dispatch::Dispatcher;
use crate::error::BusError;
use crate::exchange::{
    CommandHandlers, EventHandler, Exchange, ExchangeHandlers, ExchangeSettings, ExchangeState,
    ExchangeStats, ReceiveBudget, RetryPolicy,
};
use crate::message::{Command, Event, MessageKind, MessageType};
use crate::topic::topic_name;

/// One service's view of the bus.
///
/// Owns a [`Dispatcher`] for sending and one [`Exchange`] per registered
/// message type for receiving. Registration, handler binding, open and close
/// are serialized under one lock.
///
/// Handlers are captured when an exchange is created, so bind them before
/// [`Bus::open`]. Types registered while the bus is open get their exchange
/// right away.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::new(broker, BusConfig::load("bus.toml")?)?;
///
/// bus.register_command_type::<PlaceOrder>().await?;
/// bus.register_event_type::<OrderPlaced>().await?;
/// bus.set_command_handlers(CommandHandlers::from_fn(handle_command)).await;
/// bus.set_event_handler(EventHandler::new(handle_event)).await;
/// bus.open().await?;
///
/// bus.dispatcher().dispatch_await(&PlaceOrder { id: "o1".into() }).await?;
///
/// bus.close().await;
/// ```
pub struct Bus {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    codec: WireCodec,
    dispatcher: Dispatcher,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    command_types: Vec<MessageType>,
    event_types: Vec<MessageType>,
    command_handlers: Option<CommandHandlers>,
    event_handler: Option<EventHandler>,
    exchanges: Vec<Exchange>,
    budgets: Option<(ReceiveBudget, ReceiveBudget)>,
    open: bool,
}

impl Bus {
    /// Create a bus over `broker`. Fails on an invalid config.
    pub fn new<B: Broker>(broker: B, config: BusConfig) -> Result<Self, BusError> {
        Self::with_broker(Arc::new(broker), config)
    }

    pub fn with_broker(broker: Arc<dyn Broker>, config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let codec = WireCodec::from_config(&config)?;
        let dispatcher = Dispatcher::with_codec(broker.clone(), &config, codec.clone());
        Ok(Self {
            broker,
            config,
            codec,
            dispatcher,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The sending side of this bus.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a command type. Registering the same type twice is a no-op.
    pub async fn register_command_type<C: Command>(&self) -> Result<(), BusError> {
        self.register(MessageType::command::<C>()).await
    }

    /// Register an event type. Registering the same type twice is a no-op.
    pub async fn register_event_type<E: Event>(&self) -> Result<(), BusError> {
        self.register(MessageType::event::<E>()).await
    }

    /// Bind the fire-and-forget, await and await-with-result handlers shared
    /// by every command type.
    pub async fn set_command_handlers(&self, handlers: CommandHandlers) {
        self.registry.lock().await.command_handlers = Some(handlers);
    }

    /// Bind the handler shared by every event type.
    pub async fn set_event_handler(&self, handler: EventHandler) {
        self.registry.lock().await.event_handler = Some(handler);
    }

    pub async fn registered_command_types(&self) -> Vec<&'static str> {
        self.registry.lock().await.command_types.iter().map(MessageType::name).collect()
    }

    pub async fn registered_event_types(&self) -> Vec<&'static str> {
        self.registry.lock().await.event_types.iter().map(MessageType::name).collect()
    }

    pub async fn is_open(&self) -> bool {
        self.registry.lock().await.open
    }

    /// Start an exchange for every registered type.
    ///
    /// Fails with [`BusError::HandlersNotSet`] before starting anything if a
    /// kind has registered types but no handler.
    pub async fn open(&self) -> Result<(), BusError> {
        let mut registry = self.registry.lock().await;
        if registry.open {
            return Ok(());
        }
        if !registry.command_types.is_empty() && registry.command_handlers.is_none() {
            return Err(BusError::HandlersNotSet("command"));
        }
        if !registry.event_types.is_empty() && registry.event_handler.is_none() {
            return Err(BusError::HandlersNotSet("event"));
        }

        registry.budgets = Some((
            ReceiveBudget::from_limit(self.config.command_receive_budget),
            ReceiveBudget::from_limit(self.config.event_receive_budget),
        ));
        let types: Vec<MessageType> = registry
            .command_types
            .iter()
            .chain(registry.event_types.iter())
            .cloned()
            .collect();
        for message_type in types {
            let exchange = self.exchange_for(&registry, message_type)?;
            exchange.open();
            registry.exchanges.push(exchange);
        }
        registry.open = true;
        info!(
            commands = registry.command_types.len(),
            events = registry.event_types.len(),
            "bus opened"
        );
        Ok(())
    }

    /// Drain and close every exchange, then forget all registrations.
    ///
    /// Handlers already running finish first. The dispatcher stays usable;
    /// see [`Bus::shutdown`].
    pub async fn close(&self) {
        let mut registry = self.registry.lock().await;
        for exchange in &registry.exchanges {
            exchange.close().await;
        }
        let closed = registry.exchanges.len();
        *registry = Registry {
            command_handlers: registry.command_handlers.take(),
            event_handler: registry.event_handler.take(),
            ..Registry::default()
        };
        info!(exchanges = closed, "bus closed");
    }

    /// [`Bus::close`] plus [`Dispatcher::shutdown`].
    pub async fn shutdown(&self) {
        self.close().await;
        self.dispatcher.shutdown().await;
    }

    /// Wait until every exchange is listening. `true` if they all got there
    /// within `timeout`.
    pub async fn wait_listening(&self, timeout: Duration) -> bool {
        let mut watchers: Vec<_> = {
            let registry = self.registry.lock().await;
            registry.exchanges.iter().map(Exchange::subscribe_state).collect()
        };
        let all = async {
            for watcher in &mut watchers {
                if watcher.wait_for(|state| *state == ExchangeState::Listening).await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, all).await.unwrap_or(false)
    }

    /// Counters for the exchange of a registered type.
    pub async fn exchange_stats(&self, type_name: &str) -> Option<ExchangeStats> {
        self.registry
            .lock()
            .await
            .exchanges
            .iter()
            .find(|exchange| exchange.message_type().name() == type_name)
            .map(Exchange::stats)
    }

    /// Topic of each open exchange.
    pub async fn topics(&self) -> Vec<String> {
        self.registry
            .lock()
            .await
            .exchanges
            .iter()
            .map(|exchange| exchange.topic().to_string())
            .collect()
    }

    async fn register(&self, message_type: MessageType) -> Result<(), BusError> {
        let mut registry = self.registry.lock().await;
        let known = match message_type.kind() {
            MessageKind::Command => &registry.command_types,
            MessageKind::Event => &registry.event_types,
        };
        if known.contains(&message_type) {
            return Ok(());
        }

        if registry.open {
            let exchange = self.exchange_for(&registry, message_type.clone())?;
            exchange.open();
            registry.exchanges.push(exchange);
        }
        match message_type.kind() {
            MessageKind::Command => registry.command_types.push(message_type),
            MessageKind::Event => registry.event_types.push(message_type),
        }
        Ok(())
    }

    fn exchange_for(&self, registry: &Registry, message_type: MessageType) -> Result<Exchange, BusError> {
        let (command_budget, event_budget) = registry
            .budgets
            .clone()
            .unwrap_or_else(|| (ReceiveBudget::unbounded(), ReceiveBudget::unbounded()));
        let (handlers, concurrency, budget): (ExchangeHandlers, usize, ReceiveBudget) =
            match message_type.kind() {
                MessageKind::Command => (
                    registry
                        .command_handlers
                        .clone()
                        .ok_or(BusError::HandlersNotSet("command"))?
                        .into(),
                    self.config.command_concurrency,
                    command_budget,
                ),
                MessageKind::Event => (
                    registry
                        .event_handler
                        .clone()
                        .ok_or(BusError::HandlersNotSet("event"))?
                        .into(),
                    self.config.event_concurrency,
                    event_budget,
                ),
            };

        let topic = topic_name(
            message_type.name(),
            self.config.environment(),
            self.config.max_topic_length,
        );
        Ok(Exchange::new(
            self.broker.clone(),
            self.codec.clone(),
            message_type,
            topic,
            handlers,
            ExchangeSettings {
                concurrency,
                budget,
                retry: RetryPolicy::fixed(self.config.retry_delay()),
                idle_poll: self.config.idle_poll(),
            },
        ))
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
