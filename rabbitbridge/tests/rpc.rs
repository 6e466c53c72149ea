use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rabbitbridge::topology::request_queue_spec;
use rabbitbridge::transport::{Delivery, DeliveryStream, MessageProperties};
use rabbitbridge::{
    MemoryBroker, RabbitBridgeError, ResponseEnvelope, RouteTable, RpcClient, RpcServer,
    ServerConfig, ServerState, Transport,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

fn orders_routes() -> RouteTable {
    RouteTable::new("orders")
        .route("get", "orders/{id}", |request, params| async move {
            let id: u64 = params.parse("id")?;
            if id == 999 {
                return Err(RabbitBridgeError::handler_error("not found"));
            }
            let trace = request.header("x-trace-id").unwrap_or_default().to_string();
            Ok(ResponseEnvelope::ok(json!({ "id": id, "status": "paid" }))
                .with_header("x-trace-id", trace))
        })
        .route("post", "orders", |request, _| async move {
            Ok(ResponseEnvelope::new(
                request.data,
                201,
                HashMap::from([("location".to_string(), "/orders/43".to_string())]),
            ))
        })
        .route("get", "slow/{ms}", |_, params| async move {
            let ms: u64 = params.parse("ms")?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ResponseEnvelope::ok(json!({ "slept": ms })))
        })
}

async fn start_server(
    broker: &MemoryBroker,
    service: &str,
    routes: RouteTable,
    consumer_count: usize,
) -> (Arc<RpcServer>, JoinHandle<rabbitbridge::Result<()>>) {
    let server = Arc::new(RpcServer::new(
        service,
        Arc::new(broker.transport()),
        Arc::new(routes),
        ServerConfig { consumer_count },
    ));
    let running = tokio::spawn({
        let server = server.clone();
        async move { server.start_listening().await }
    });
    server.wait_until_listening().await;
    (server, running)
}

fn client(broker: &MemoryBroker, name: &str) -> RpcClient {
    RpcClient::new(name, Arc::new(broker.transport()))
}

#[tokio::test]
async fn scenario_a_round_trip() {
    let broker = MemoryBroker::new();
    let (server, running) = start_server(&broker, "orders", orders_routes(), 1).await;
    let client = client(&broker, "gateway");

    let headers = HashMap::from([("x-trace-id".to_string(), "t-1".to_string())]);
    let response = client
        .send_request("orders", "get", "orders/42", json!({}), headers, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.data, json!({ "id": 42, "status": "paid" }));
    assert_eq!(response.headers.get("x-trace-id").map(String::as_str), Some("t-1"));
    assert_eq!(client.pending_calls(), 0);

    server.stop_listening();
    running.await.unwrap().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn round_trip_preserves_body_status_and_headers() {
    let broker = MemoryBroker::new();
    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 1).await;
    let client = client(&broker, "gateway");

    let body = json!({ "basket": 7, "lines": [{ "sku": "tea-01", "qty": 2 }], "note": "ümlaut" });
    let response = client
        .send_request("orders", "post", "orders", body.clone(), HashMap::new(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.data, body);
    assert_eq!(response.headers.get("location").map(String::as_str), Some("/orders/43"));
}

#[tokio::test]
async fn scenario_b_handler_error_is_a_500_response() {
    let broker = MemoryBroker::new();
    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 1).await;
    let client = client(&broker, "gateway");

    let response = client
        .send_request("orders", "get", "orders/999", json!({}), HashMap::new(), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.status, 500);
    assert_eq!(response.error_message(), Some("not found"));
    assert_eq!(broker.unacked_count("orders.requests"), 0);
    assert_eq!(broker.message_count("orders.requests"), 0);
}

#[tokio::test]
async fn unknown_route_is_a_404_response() {
    let broker = MemoryBroker::new();
    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 1).await;
    let client = client(&broker, "gateway");

    let response = client
        .send_request("orders", "get", "invoices/1", json!({}), HashMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert!(response.error_message().is_some());
}

#[tokio::test]
async fn scenario_c_missing_service_times_out() {
    let broker = MemoryBroker::new();
    let client = client(&broker, "gateway");

    let started = Instant::now();
    let err = client
        .send_request("ghost-service", "get", "x", json!({}), HashMap::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RabbitBridgeError::RequestTimeout { ref service, .. } if service == "ghost-service"));
    assert_eq!(err.to_string(), "no response from ghost-service within 1s");
    assert!(elapsed >= Duration::from_millis(950), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned too late: {elapsed:?}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn timeout_with_declared_but_idle_queue_leaves_nothing_pending() {
    let broker = MemoryBroker::new();
    let (server, running) = start_server(&broker, "orders", orders_routes(), 1).await;
    server.stop_listening();
    running.await.unwrap().unwrap();

    let client = client(&broker, "gateway");
    let err = client
        .send_request("orders", "get", "orders/1", json!({}), HashMap::new(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitBridgeError::RequestTimeout { .. }));
    assert_eq!(client.pending_calls(), 0);
    // the request stays queued for the next consumer
    assert_eq!(broker.message_count("orders.requests"), 1);
}

async fn next_request(requests: &mut DeliveryStream) -> Delivery {
    let delivery = tokio::time::timeout(Duration::from_secs(1), requests.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    delivery.ack().await.unwrap();
    delivery
}

async fn reply(transport: &impl Transport, request: &Delivery, body: &[u8]) {
    let properties = MessageProperties::json()
        .with_correlation_id(request.properties.correlation_id.clone().unwrap());
    transport
        .publish("", request.properties.reply_to.as_deref().unwrap(), body, properties)
        .await
        .unwrap();
}

#[tokio::test]
async fn late_reply_is_dropped_and_undecodable_reply_is_invalid() {
    let broker = MemoryBroker::new();
    let responder = broker.transport();
    responder.connect().await.unwrap();
    responder.declare_queue(&request_queue_spec("orders")).await.unwrap();
    let mut requests = responder.consume("orders.requests", 10, "responder").await.unwrap();
    let client = Arc::new(client(&broker, "gateway"));

    let err = client
        .send_request("orders", "get", "orders/1", json!({}), HashMap::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitBridgeError::RequestTimeout { .. }));
    let expired = next_request(&mut requests).await;

    let second = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_request("orders", "get", "orders/2", json!({}), HashMap::new(), Duration::from_secs(2))
                .await
        }
    });
    let current = next_request(&mut requests).await;
    assert_eq!(client.pending_calls(), 1);
    assert_ne!(expired.properties.correlation_id, current.properties.correlation_id);

    let late = ResponseEnvelope::ok(json!({ "id": 1 })).to_bytes().unwrap();
    reply(&responder, &expired, &late).await;
    reply(&responder, &current, b"not json").await;

    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, RabbitBridgeError::InvalidResponse { .. }), "unexpected error: {err}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn concurrent_calls_receive_their_own_replies_out_of_order() {
    let broker = MemoryBroker::new();
    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 2).await;
    let client = Arc::new(client(&broker, "gateway"));

    let slow = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_request("orders", "get", "slow/400", json!({}), HashMap::new(), Duration::from_secs(5))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = client
        .send_request("orders", "get", "slow/10", json!({}), HashMap::new(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(fast.data, json!({ "slept": 10 }));
    assert_eq!(client.pending_calls(), 1);

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.data, json!({ "slept": 400 }));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn independent_clients_are_isolated() {
    let broker = MemoryBroker::new();
    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 4).await;
    let first = Arc::new(client(&broker, "gateway-1"));
    let second = Arc::new(client(&broker, "gateway-2"));

    let mut calls = Vec::new();
    for id in 1..=20u64 {
        let client = if id % 2 == 0 { first.clone() } else { second.clone() };
        calls.push(tokio::spawn(async move {
            let response = client
                .send_request(
                    "orders",
                    "get",
                    &format!("orders/{id}"),
                    json!({}),
                    HashMap::new(),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            (id, response)
        }));
    }

    for call in calls {
        let (id, response) = call.await.unwrap();
        assert_eq!(response.data["id"], Value::from(id));
    }
    assert_eq!(first.pending_calls(), 0);
    assert_eq!(second.pending_calls(), 0);
}

#[tokio::test]
async fn single_consumer_handles_requests_in_order() {
    let broker = MemoryBroker::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let routes = RouteTable::new("baskets").route("post", "baskets/{id}", {
        let seen = seen.clone();
        move |_, params| {
            let seen = seen.clone();
            async move {
                let id: u64 = params.parse("id")?;
                seen.lock().unwrap().push(id);
                Ok(ResponseEnvelope::ok(json!({ "id": id })))
            }
        }
    });
    let (_server, _running) = start_server(&broker, "baskets", routes, 1).await;
    let client = Arc::new(client(&broker, "gateway"));
    client
        .send_request("baskets", "post", "baskets/0", json!({}), HashMap::new(), Duration::from_secs(5))
        .await
        .unwrap();
    seen.lock().unwrap().clear();

    let mut calls = Vec::new();
    for id in 0..10u64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .send_request(
                    "baskets",
                    "post",
                    &format!("baskets/{id}"),
                    json!({}),
                    HashMap::new(),
                    Duration::from_secs(5),
                )
                .await
        }));
        // publish order is the queue order
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn client_recovers_after_broker_restart() {
    let broker = MemoryBroker::new();
    let client = client(&broker, "gateway");
    let (_server, running) = start_server(&broker, "orders", orders_routes(), 1).await;

    client
        .send_request("orders", "get", "orders/1", json!({}), HashMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    let first_reply_queue = client.get_stats().await.reply_queue.unwrap();

    broker.disconnect_all();
    assert!(running.await.unwrap().is_err());
    assert!(!broker.queue_exists(&first_reply_queue));

    let (_server, _running) = start_server(&broker, "orders", orders_routes(), 1).await;
    let response = client
        .send_request("orders", "get", "orders/2", json!({}), HashMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.data["id"], 2);

    let stats = client.get_stats().await;
    assert!(stats.connected);
    assert_ne!(stats.reply_queue.as_deref(), Some(first_reply_queue.as_str()));
}

#[tokio::test]
async fn unreachable_broker_is_a_connection_error() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let client = client(&broker, "gateway");

    let err = client
        .send_request("orders", "get", "orders/1", json!({}), HashMap::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_connection_fault(), "unexpected error: {err}");
}
