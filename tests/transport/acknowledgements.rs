//! Correlated acknowledgements: awaiting completion and results.

use std::time::Duration;

use sourced_bus::{Acknowledgement, BusError, DispatchMode, InMemoryBroker, WireCodec};

use crate::support::{self, Journal, OrderTotal, PlaceOrder, PriceOrder};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_in_reverse_order_reach_their_own_callers() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;
    let dispatcher = bus.dispatcher().clone();

    // Later requests finish first: replies come back 4, 3, 2, 1, 0.
    let callers: Vec<_> = (0..5u32)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let command = PriceOrder {
                    id: format!("o{}", i),
                    quantity: i + 1,
                    unit_price: 10,
                    delay_ms: u64::from(5 - i) * 60,
                };
                let total: OrderTotal = dispatcher.dispatch_await_with_result(&command).await?;
                Ok::<_, BusError>((i, total))
            })
        })
        .collect();

    for caller in callers {
        let (i, total) = caller.await.unwrap().unwrap();
        assert_eq!(
            total,
            OrderTotal {
                id: format!("o{}", i),
                total: (i + 1) * 10,
            }
        );
    }

    assert_eq!(journal.ids(), vec!["o4", "o3", "o2", "o1", "o0"]);

    let codec = WireCodec::from_config(&support::config()).unwrap();
    let arrival: Vec<String> = broker
        .records(dispatcher.reply_topic())
        .iter()
        .map(|record| {
            let ack: Acknowledgement = codec.decode(&record.value).unwrap();
            ack.decode_result::<OrderTotal>().unwrap().id
        })
        .collect();
    assert_eq!(arrival, vec!["o4", "o3", "o2", "o1", "o0"]);
    assert_eq!(dispatcher.pending_replies(), 0);

    bus.shutdown().await;
}

#[tokio::test]
async fn await_completion_returns_after_the_handler() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;

    bus.dispatcher()
        .dispatch_await(&PlaceOrder::slow("o1", 50))
        .await
        .unwrap();

    let seen = journal.entries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mode, DispatchMode::AwaitHandlerCompletion);
    assert_eq!(seen[0].source_service.as_deref(), Some("orders"));
    bus.shutdown().await;
}

#[tokio::test]
async fn result_is_decoded_into_the_requested_type() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;

    let total: OrderTotal = bus
        .dispatcher()
        .dispatch_await_with_result(&PriceOrder {
            id: "o1".into(),
            quantity: 3,
            unit_price: 7,
            delay_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(total.total, 21);
    assert_eq!(journal.entries()[0].mode, DispatchMode::AwaitHandlerResult);

    // A result that does not fit the requested type is a local decode error.
    let mismatch = bus
        .dispatcher()
        .dispatch_await_with_result::<_, Vec<u32>>(&PriceOrder {
            id: "o2".into(),
            quantity: 1,
            unit_price: 1,
            delay_ms: 0,
        })
        .await;
    assert!(matches!(mismatch, Err(BusError::Serialization(_))));
    bus.shutdown().await;
}

#[tokio::test]
async fn deadline_evicts_and_late_reply_is_dropped() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, support::config(), &journal).await;
    let dispatcher = bus.dispatcher();

    let err = dispatcher
        .dispatch_await_within(&PlaceOrder::slow("late", 150), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout { ref topic, .. } if topic == "test_PlaceOrder"));
    assert_eq!(dispatcher.pending_replies(), 0);

    // The late acknowledgement arrives and is ignored.
    support::eventually(|| broker.records(dispatcher.reply_topic()).len() == 1).await;
    assert_eq!(journal.ids(), vec!["late"]);

    dispatcher
        .dispatch_await_within(&PlaceOrder::new("next"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(dispatcher.pending_replies(), 0);
    bus.shutdown().await;
}

#[tokio::test]
async fn configured_reply_timeout_applies_without_explicit_deadline() {
    let broker = InMemoryBroker::new();
    let config = sourced_bus::BusConfig {
        reply_timeout_ms: Some(30),
        ..support::config()
    };
    // Nobody consumes PlaceOrder on this broker.
    let bus = sourced_bus::Bus::new(broker, config).unwrap();

    let result = bus.dispatcher().dispatch_await(&PlaceOrder::new("o1")).await;
    assert!(matches!(
        result,
        Err(BusError::Timeout { timeout, .. }) if timeout == Duration::from_millis(30)
    ));
    bus.shutdown().await;
}
