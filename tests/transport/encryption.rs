#![cfg(feature = "encryption")]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sourced_bus::{BusConfig, Envelope, InMemoryBroker, WireCodec};

use crate::support::{self, Journal, OrderTotal, PlaceOrder, PriceOrder};

fn sealed_config() -> BusConfig {
    BusConfig {
        encryption_key: Some(STANDARD.encode([7u8; 32])),
        ..support::config()
    }
}

#[tokio::test]
async fn encrypted_bus_round_trips_commands_and_replies() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let bus = support::order_bus(&broker, sealed_config(), &journal).await;

    let total: OrderTotal = bus
        .dispatcher()
        .dispatch_await_with_result(&PriceOrder {
            id: "o1".into(),
            quantity: 2,
            unit_price: 5,
            delay_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(total.total, 10);

    let sealed = WireCodec::from_config(&sealed_config()).unwrap();
    let plain = WireCodec::from_config(&support::config()).unwrap();
    let command = &broker.records("test_PriceOrder")[0];
    assert!(plain.decode::<Envelope>(&command.value).is_err());
    assert_eq!(sealed.decode::<Envelope>(&command.value).unwrap().message_type, "PriceOrder");

    let reply = &broker.records(bus.dispatcher().reply_topic())[0];
    assert!(plain.decode::<sourced_bus::Acknowledgement>(&reply.value).is_err());
    bus.shutdown().await;
}

#[tokio::test]
async fn consumer_with_another_key_drops_the_message() {
    let broker = InMemoryBroker::new();
    let journal = Journal::new();
    let other_key = BusConfig {
        encryption_key: Some(STANDARD.encode([9u8; 32])),
        ..support::config()
    };
    let bus = support::order_bus(&broker, other_key, &journal).await;

    let sender = sourced_bus::Bus::new(broker.clone(), sealed_config()).unwrap();
    sender
        .dispatcher()
        .dispatch_fire_and_forget(&PlaceOrder::new("o1"))
        .await
        .unwrap();

    let stats = support::stats_when(&bus, "PlaceOrder", |stats| stats.dropped == 1).await;
    assert_eq!(stats.handled, 0);
    assert_eq!(journal.len(), 0);

    sender.shutdown().await;
    bus.shutdown().await;
}
