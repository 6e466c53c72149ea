use std::time::Duration;

use futures_util::StreamExt;
use rabbitbridge::topology::{DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, EVENTS_EXCHANGE};
use rabbitbridge::transport::MessageProperties;
use rabbitbridge::{setup_topology, EventQueue, MemoryBroker, TopologySpec, Transport};

fn shop() -> TopologySpec {
    TopologySpec::default()
        .with_service("orders")
        .with_service("baskets")
        .with_event_queue(EventQueue::new("orders", ["order.*", "payment.*"]))
        .with_event_queue(EventQueue::new("deliveries", ["delivery.*", "order.shipped"]))
}

fn sorted(mut bindings: Vec<(String, String)>) -> Vec<(String, String)> {
    bindings.sort();
    bindings
}

#[tokio::test]
async fn setup_declares_the_whole_graph() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    setup_topology(&transport, &shop(), false).await.unwrap();

    assert!(broker.exchange_exists(EVENTS_EXCHANGE));
    assert!(broker.exchange_exists(DEAD_LETTER_EXCHANGE));
    for queue in ["orders.requests", "baskets.requests", "orders.events", "deliveries.events"] {
        assert!(broker.queue_exists(queue), "{queue} missing");
        let spec = broker.queue_spec(queue).unwrap();
        assert!(spec.durable);
        assert_eq!(spec.dead_letter_exchange(), Some(DEAD_LETTER_EXCHANGE));
    }
    assert_eq!(
        sorted(broker.bindings("deliveries.events")),
        vec![
            (EVENTS_EXCHANGE.to_string(), "delivery.*".to_string()),
            (EVENTS_EXCHANGE.to_string(), "order.shipped".to_string()),
        ]
    );
    assert_eq!(
        broker.bindings(DEAD_LETTER_QUEUE),
        vec![(DEAD_LETTER_EXCHANGE.to_string(), "#".to_string())]
    );
    // request queues are reached through the default exchange only
    assert!(broker.bindings("orders.requests").is_empty());
}

#[tokio::test]
async fn setup_twice_is_idempotent() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let spec = shop();

    setup_topology(&transport, &spec, false).await.unwrap();
    let before: Vec<_> = spec
        .queue_names()
        .iter()
        .map(|queue| sorted(broker.bindings(queue)))
        .collect();

    setup_topology(&transport, &spec, false).await.unwrap();
    let after: Vec<_> = spec
        .queue_names()
        .iter()
        .map(|queue| sorted(broker.bindings(queue)))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn force_recreates_without_leftovers() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let spec = shop();
    setup_topology(&transport, &spec, false).await.unwrap();

    transport
        .bind("orders.events", EVENTS_EXCHANGE, "legacy.#")
        .await
        .unwrap();
    transport
        .publish("", "orders.requests", b"{}", MessageProperties::json())
        .await
        .unwrap();
    assert_eq!(broker.message_count("orders.requests"), 1);

    setup_topology(&transport, &spec, true).await.unwrap();

    assert_eq!(
        sorted(broker.bindings("orders.events")),
        vec![
            (EVENTS_EXCHANGE.to_string(), "order.*".to_string()),
            (EVENTS_EXCHANGE.to_string(), "payment.*".to_string()),
        ]
    );
    assert_eq!(broker.message_count("orders.requests"), 0);
}

#[tokio::test]
async fn redeclaring_with_other_arguments_is_a_topology_error() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    transport.connect().await.unwrap();
    transport
        .declare_queue(&rabbitbridge::transport::QueueSpec::durable("orders.requests"))
        .await
        .unwrap();

    let err = setup_topology(&transport, &shop(), false).await.unwrap_err();
    assert!(matches!(err, rabbitbridge::RabbitBridgeError::Topology { .. }), "{err}");

    // force clears the conflicting queue first
    setup_topology(&transport, &shop(), true).await.unwrap();
}

#[tokio::test]
async fn rejected_events_reach_the_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    setup_topology(&transport, &shop(), false).await.unwrap();

    transport
        .publish(
            EVENTS_EXCHANGE,
            "order.created",
            br#"{"id":42}"#,
            MessageProperties::json().persistent(true),
        )
        .await
        .unwrap();
    assert_eq!(broker.message_count("orders.events"), 1);
    assert_eq!(broker.message_count("deliveries.events"), 0);

    let mut events = transport.consume("orders.events", 1, "orders-events").await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    delivery.nack(false).await.unwrap();

    let mut dead = transport.consume(DEAD_LETTER_QUEUE, 1, "dlq").await.unwrap();
    let dead_letter = tokio::time::timeout(Duration::from_secs(1), dead.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(dead_letter.routing_key, "order.created");
    assert_eq!(dead_letter.body, br#"{"id":42}"#);
}

#[tokio::test]
async fn unreachable_broker_fails_setup() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let err = setup_topology(&broker.transport(), &shop(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, rabbitbridge::RabbitBridgeError::Topology { .. }));
}
