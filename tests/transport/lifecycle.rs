use std::time::Duration;

use sourced_bus::{Bus, BusError, InMemoryBroker};

use crate::support::{self, Journal, OrderPlaced, PlaceOrder, PriceOrder};

#[tokio::test]
async fn open_requires_handlers_for_registered_kinds() {
    let broker = InMemoryBroker::new();
    let bus = Bus::new(broker.clone(), support::config()).unwrap();

    bus.register_command_type::<PlaceOrder>().await.unwrap();
    assert!(matches!(bus.open().await, Err(BusError::HandlersNotSet("command"))));

    bus.set_command_handlers(support::order_handlers(&Journal::new())).await;
    bus.register_event_type::<OrderPlaced>().await.unwrap();
    assert!(matches!(bus.open().await, Err(BusError::HandlersNotSet("event"))));
    assert!(!bus.is_open().await);
    assert!(broker.topics().is_empty());

    bus.set_event_handler(support::event_journal(&Journal::new())).await;
    bus.open().await.unwrap();
    assert!(bus.is_open().await);
    bus.shutdown().await;
}

#[tokio::test]
async fn registration_is_idempotent() {
    let bus = Bus::new(InMemoryBroker::new(), support::config()).unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.register_event_type::<OrderPlaced>().await.unwrap();

    assert_eq!(bus.registered_command_types().await, vec!["PlaceOrder"]);
    assert_eq!(bus.registered_event_types().await, vec!["orders.OrderPlaced"]);
}

#[tokio::test]
async fn types_registered_after_open_start_listening_immediately() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = Bus::new(broker.clone(), support::config()).unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.set_command_handlers(support::order_handlers(&journal)).await;
    bus.open().await.unwrap();

    bus.register_command_type::<PriceOrder>().await.unwrap();
    assert!(bus.wait_listening(Duration::from_secs(2)).await);
    assert_eq!(bus.topics().await.len(), 2);

    bus.dispatcher()
        .dispatch_await(&PriceOrder {
            id: "late".into(),
            quantity: 1,
            unit_price: 1,
            delay_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(journal.ids(), vec!["late"]);
    bus.shutdown().await;
}

#[tokio::test]
async fn close_forgets_types_but_keeps_handlers() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;

    bus.close().await;
    assert!(!bus.is_open().await);
    assert!(bus.registered_command_types().await.is_empty());
    assert!(bus.topics().await.is_empty());
    assert!(bus.exchange_stats("PlaceOrder").await.is_none());

    // Same handlers serve the re-registered type after reopening.
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.open().await.unwrap();
    assert!(bus.wait_listening(Duration::from_secs(2)).await);
    bus.dispatcher()
        .dispatch_await(&PlaceOrder::new("again"))
        .await
        .unwrap();
    assert_eq!(journal.ids(), vec!["again"]);
    bus.shutdown().await;
}

#[tokio::test]
async fn dispatcher_outlives_a_closed_bus() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let consumer = support::order_bus(&broker, support::config(), &journal).await;
    let caller = Bus::new(broker.clone(), support::config()).unwrap();

    caller.close().await;
    caller
        .dispatcher()
        .dispatch_await(&PlaceOrder::new("o1"))
        .await
        .unwrap();
    assert_eq!(journal.ids(), vec!["o1"]);

    caller.shutdown().await;
    assert!(caller.dispatcher().is_shut_down());
    consumer.shutdown().await;
}
