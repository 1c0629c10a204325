//! Test domain: orders, plus helpers for standing up buses on an in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sourced_bus::exchange::CallContext;
use sourced_bus::{
    identity, Bus, BusConfig, CommandHandlers, DispatchMode, EventHandler, ExchangeStats, HandlerError,
    Identity, InMemoryBroker, Payload,
};

/// Command: place an order, optionally slowly or failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub id: String,
    pub delay_ms: u64,
    pub fail_with: Option<String>,
}
sourced_bus::command!(PlaceOrder);

impl PlaceOrder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay_ms: 0,
            fail_with: None,
        }
    }

    pub fn slow(id: &str, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::new(id)
        }
    }

    pub fn failing(id: &str, message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(id)
        }
    }
}

/// Command: price an order; the handler answers with an [`OrderTotal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOrder {
    pub id: String,
    pub quantity: u32,
    pub unit_price: u32,
    pub delay_ms: u64,
}
sourced_bus::command!(PriceOrder);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotal {
    pub id: String,
    pub total: u32,
}

/// Event: an order was placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: String,
}
sourced_bus::event!(OrderPlaced => "orders.OrderPlaced");

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Seen {
    pub id: String,
    pub message_type: &'static str,
    pub mode: DispatchMode,
    /// Ambient identity observed inside the handler.
    pub ambient: Option<Identity>,
    /// Identity passed in the call context.
    pub passed: Option<Identity>,
    pub source_service: Option<String>,
}

/// Shared record of what handlers saw, in completion order.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<Seen>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, ctx: &CallContext) {
        self.entries.lock().push(Seen {
            id: id.to_string(),
            message_type: ctx.message_type,
            mode: ctx.mode,
            ambient: identity::current(),
            passed: ctx.identity.clone(),
            source_service: ctx.source_service.clone(),
        });
    }

    pub fn entries(&self) -> Vec<Seen> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|s| s.id.clone()).collect()
    }
}

/// Handles every order command. Identity is read after the delay, so it must
/// survive await points inside the handler.
pub async fn handle_order(payload: Payload, ctx: CallContext, journal: Journal) -> Result<Value, HandlerError> {
    if let Some(order) = payload.downcast_ref::<PlaceOrder>() {
        tokio::time::sleep(Duration::from_millis(order.delay_ms)).await;
        journal.record(&order.id, &ctx);
        return match &order.fail_with {
            Some(message) => Err(HandlerError::other(message.clone())),
            None => Ok(json!({ "id": order.id })),
        };
    }
    if let Some(price) = payload.downcast_ref::<PriceOrder>() {
        tokio::time::sleep(Duration::from_millis(price.delay_ms)).await;
        journal.record(&price.id, &ctx);
        let total = OrderTotal {
            id: price.id.clone(),
            total: price.quantity * price.unit_price,
        };
        return Ok(serde_json::to_value(total)?);
    }
    Err(HandlerError::Rejected(format!("unexpected {}", payload.type_name())))
}

pub fn order_handlers(journal: &Journal) -> CommandHandlers {
    let journal = journal.clone();
    CommandHandlers::from_fn(move |payload, ctx| handle_order(payload, ctx, journal.clone()))
}

pub fn event_journal(journal: &Journal) -> EventHandler {
    let journal = journal.clone();
    EventHandler::new(move |payload, ctx| {
        let journal = journal.clone();
        async move {
            let event = payload
                .downcast::<OrderPlaced>()
                .map_err(|p| HandlerError::DecodeFailed(p.type_name().to_string()))?;
            journal.record(&event.id, &ctx);
            Ok::<(), HandlerError>(())
        }
    })
}

pub fn config() -> BusConfig {
    BusConfig {
        environment: Some("test".into()),
        service_name: Some("orders".into()),
        retry_delay_ms: 20,
        idle_poll_ms: 5,
        reply_timeout_ms: Some(5_000),
        ..BusConfig::default()
    }
}

/// A bus with both order commands registered and open.
pub async fn order_bus(broker: &InMemoryBroker, config: BusConfig, journal: &Journal) -> Bus {
    init_tracing();
    let bus = Bus::new(broker.clone(), config).unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.register_command_type::<PriceOrder>().await.unwrap();
    bus.set_command_handlers(order_handlers(journal)).await;
    bus.open().await.unwrap();
    assert!(bus.wait_listening(Duration::from_secs(2)).await);
    bus
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Poll an exchange's counters until `check` holds, failing after two seconds.
pub async fn stats_when(bus: &Bus, type_name: &str, check: impl Fn(&ExchangeStats) -> bool) -> ExchangeStats {
    for _ in 0..400 {
        if let Some(stats) = bus.exchange_stats(type_name).await {
            if check(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} counters did not settle within 2s", type_name);
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
