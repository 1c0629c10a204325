use std::collections::HashSet;
use std::time::Duration;

use sourced_bus::{Bus, DispatchMode, InMemoryBroker};

use crate::support::{self, Journal, OrderPlaced, PlaceOrder};

async fn listener_bus(broker: &InMemoryBroker, journal: &Journal) -> Bus {
    let bus = Bus::new(broker.clone(), support::config()).unwrap();
    bus.register_event_type::<OrderPlaced>().await.unwrap();
    bus.set_event_handler(support::event_journal(journal)).await;
    bus.open().await.unwrap();
    assert!(bus.wait_listening(Duration::from_secs(2)).await);
    bus
}

#[tokio::test]
async fn every_subscriber_sees_every_event() {
    let broker = InMemoryBroker::new();
    let (first, second) = (Journal::new(), Journal::new());
    let a = listener_bus(&broker, &first).await;
    let b = listener_bus(&broker, &second).await;

    a.dispatcher()
        .publish(&OrderPlaced { id: "o1".into() })
        .await
        .unwrap();
    b.dispatcher()
        .publish(&OrderPlaced { id: "o2".into() })
        .await
        .unwrap();

    support::eventually(|| first.len() == 2 && second.len() == 2).await;
    for journal in [&first, &second] {
        let mut ids = journal.ids();
        ids.sort();
        assert_eq!(ids, vec!["o1", "o2"]);
        assert!(journal
            .entries()
            .iter()
            .all(|seen| seen.mode == DispatchMode::FireAndForget
                && seen.message_type == "orders.OrderPlaced"));
    }

    assert_eq!(broker.groups("test_orders.OrderPlaced").len(), 2);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn subscribers_only_see_events_published_after_they_joined() {
    let broker = InMemoryBroker::new();
    let publisher = Bus::new(broker.clone(), support::config()).unwrap();
    publisher
        .dispatcher()
        .publish(&OrderPlaced { id: "before".into() })
        .await
        .unwrap();

    let journal = Journal::new();
    let bus = listener_bus(&broker, &journal).await;
    publisher
        .dispatcher()
        .publish(&OrderPlaced { id: "after".into() })
        .await
        .unwrap();

    support::eventually(|| journal.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(journal.ids(), vec!["after"]);

    publisher.shutdown().await;
    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_are_shared_between_instances_of_a_service() {
    let broker = InMemoryBroker::new();
    let (first, second) = (Journal::new(), Journal::new());
    let a = support::order_bus(&broker, support::config(), &first).await;
    let b = support::order_bus(&broker, support::config(), &second).await;

    for i in 0..6 {
        a.dispatcher()
            .dispatch_fire_and_forget(&PlaceOrder::slow(&format!("o{}", i), 10))
            .await
            .unwrap();
    }
    support::eventually(|| first.len() + second.len() == 6).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handled: Vec<String> = first.ids().into_iter().chain(second.ids()).collect();
    assert_eq!(handled.len(), 6);
    let unique: HashSet<&String> = handled.iter().collect();
    assert_eq!(unique.len(), 6);
    assert_eq!(broker.groups("test_PlaceOrder"), vec!["test_PlaceOrder"]);

    a.shutdown().await;
    b.shutdown().await;
}
