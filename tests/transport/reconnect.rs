use std::time::Duration;

use sourced_bus::{Bus, InMemoryBroker};

use crate::support::{self, Journal, PlaceOrder};

#[tokio::test]
async fn outage_is_survived_by_exchanges_and_ack_listener() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;
    let dispatcher = bus.dispatcher();

    dispatcher.dispatch_await(&PlaceOrder::new("before")).await.unwrap();

    broker.set_available(false);
    for type_name in ["PlaceOrder", "PriceOrder"] {
        support::stats_when(&bus, type_name, |stats| stats.reconnects >= 1).await;
    }
    assert!(dispatcher.dispatch_fire_and_forget(&PlaceOrder::new("lost")).await.is_err());

    broker.set_available(true);
    assert!(bus.wait_listening(Duration::from_secs(2)).await);

    dispatcher
        .dispatch_await_within(&PlaceOrder::new("after"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(journal.ids(), vec!["before", "after"]);
    bus.shutdown().await;
}

#[tokio::test]
async fn bus_opened_during_an_outage_starts_once_the_broker_returns() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let journal = Journal::new();

    let bus = Bus::new(broker.clone(), support::config()).unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.set_command_handlers(support::order_handlers(&journal)).await;
    bus.open().await.unwrap();
    assert!(!bus.wait_listening(Duration::from_millis(60)).await);

    broker.set_available(true);
    assert!(bus.wait_listening(Duration::from_secs(2)).await);
    let stats = bus.exchange_stats("PlaceOrder").await.unwrap();
    assert!(stats.reconnects >= 1);

    bus.dispatcher()
        .dispatch_await(&PlaceOrder::new("o1"))
        .await
        .unwrap();
    assert_eq!(journal.ids(), vec!["o1"]);
    bus.shutdown().await;
}

#[tokio::test]
async fn failed_subscribes_are_retried_on_the_fixed_delay() {
    let broker = InMemoryBroker::new();
    broker.fail_next_subscribes(3);
    let journal = Journal::new();

    let started = tokio::time::Instant::now();
    let bus = Bus::new(broker.clone(), support::config()).unwrap();
    bus.register_command_type::<PlaceOrder>().await.unwrap();
    bus.set_command_handlers(support::order_handlers(&journal)).await;
    bus.open().await.unwrap();
    assert!(bus.wait_listening(Duration::from_secs(2)).await);

    // Three failures, each followed by a 20ms pause.
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(bus.exchange_stats("PlaceOrder").await.unwrap().reconnects, 3);
    assert_eq!(broker.subscribe_attempts(), 4);
    bus.shutdown().await;
}
