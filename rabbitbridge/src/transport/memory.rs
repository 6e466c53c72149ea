//! In-process broker.
//!
//! [`MemoryBroker`] keeps exchanges, queues and bindings in memory and mimics
//! the RabbitMQ behaviour the bridge depends on: implicit default-exchange
//! addressing, topic wildcards, per-consumer prefetch with round-robin
//! dispatch, manual acknowledgement, requeue, dead-lettering, exclusive and
//! auto-delete queues, and redelivery of unacknowledged messages when a
//! connection goes away. Each [`MemoryTransport`] is one connection to it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Acknowledger, Delivery, DeliveryStream, ExchangeKind, MessageProperties,
    QueueSpec, Transport, DEAD_LETTER_ROUTING_KEY_ARG, DEFAULT_EXCHANGE,
};
use crate::error::{RabbitBridgeError, Result};

/// Acquire the broker lock, ignoring poisoning: a panic in one test task must
/// not wedge every other connection
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
    unacked: HashMap<u64, StoredMessage>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    /// Put every unacknowledged message of a departing consumer back at the
    /// head of the queue, flagged as redelivered
    fn requeue_unacked(&mut self, slot: ConsumerSlot) {
        let mut pending: Vec<(u64, StoredMessage)> = slot.unacked.into_iter().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in pending.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: Vec<u64>,
    next_delivery_tag: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    available: AtomicBool,
}

/// Shared in-memory broker; cheap to clone
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// New, not yet connected transport for this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            connection: Mutex::new(None),
        }
    }

    /// Make subsequent connection attempts fail (broker "down")
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Drop every open connection as a broker restart would
    pub fn disconnect_all(&self) {
        let connections = self.state().connections.clone();
        for connection in connections {
            self.close_connection(connection);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    /// `(exchange, routing_key)` pairs bound to `queue`
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| (binding.exchange.clone(), binding.routing_key.clone()))
            .collect()
    }

    /// Messages ready for delivery (excludes unacknowledged ones)
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.iter().map(|slot| slot.unacked.len()).sum())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.len())
            .unwrap_or(0)
    }

    /// Declared arguments of `queue`
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state().queues.get(queue).map(|queue| queue.spec.clone())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock_ignore_poison(&self.inner.state)
    }

    fn open_connection(&self) -> Result<u64> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(RabbitBridgeError::Connection {
                endpoint: "memory".to_string(),
                attempts: 1,
                reason: "broker unavailable".to_string(),
            });
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.state().connections.push(id);
        Ok(id)
    }

    fn is_open(&self, connection: u64) -> bool {
        self.state().connections.contains(&connection)
    }

    fn close_connection(&self, connection: u64) {
        let mut state = self.state();
        state.connections.retain(|id| *id != connection);

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            let Some(queue) = state.queues.get_mut(&name) else {
                continue;
            };
            let mut index = 0;
            let mut cancelled = false;
            while index < queue.consumers.len() {
                if queue.consumers[index].connection == connection {
                    let slot = queue.consumers.remove(index);
                    queue.requeue_unacked(slot);
                    cancelled = true;
                } else {
                    index += 1;
                }
            }
            queue.next_consumer = 0;

            let owned = queue.owner == Some(connection);
            let abandoned = cancelled && queue.spec.auto_delete && queue.consumers.is_empty();
            if owned || abandoned {
                Self::remove_queue(&mut state, &name);
            } else {
                self.dispatch(&mut state, &name);
            }
        }
        debug!("Memory connection {} closed", connection);
    }

    fn remove_queue(state: &mut BrokerState, name: &str) {
        state.queues.remove(name);
        state.bindings.retain(|binding| binding.queue != name);
        debug!("Queue {} removed", name);
    }

    fn check_owner(queue: &QueueState, connection: u64) -> Result<()> {
        match queue.owner {
            Some(owner) if owner != connection => Err(RabbitBridgeError::broker_error(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                queue.spec.name
            ))),
            _ => Ok(()),
        }
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Err(RabbitBridgeError::broker_error(
                "ACCESS_REFUSED - the default exchange cannot be redeclared",
            ));
        }
        let mut state = self.state();
        let wanted = ExchangeState { kind, durable };
        match state.exchanges.get(name) {
            Some(existing) if *existing != wanted => Err(RabbitBridgeError::broker_error(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), wanted);
                Ok(())
            }
        }
    }

    fn declare_queue(&self, connection: u64, spec: &QueueSpec) -> Result<String> {
        let mut spec = spec.clone();
        if spec.name.is_empty() {
            spec.name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        }

        let mut state = self.state();
        if let Some(existing) = state.queues.get(&spec.name) {
            Self::check_owner(existing, connection)?;
            if existing.spec != spec {
                return Err(RabbitBridgeError::broker_error(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    spec.name
                )));
            }
            return Ok(spec.name);
        }

        let name = spec.name.clone();
        state.queues.insert(
            name.clone(),
            QueueState {
                owner: spec.exclusive.then_some(connection),
                spec,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    fn bind(&self, connection: u64, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state();
        let Some(target) = state.queues.get(queue) else {
            return Err(RabbitBridgeError::broker_error(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };
        Self::check_owner(target, connection)?;
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitBridgeError::broker_error(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn delete_exchange(&self, name: &str) {
        let mut state = self.state();
        state.exchanges.remove(name);
        state.bindings.retain(|binding| binding.exchange != name);
    }

    fn delete_queue(&self, connection: u64, name: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(queue) = state.queues.get(name) {
            Self::check_owner(queue, connection)?;
            Self::remove_queue(&mut state, name);
        }
        Ok(())
    }

    /// Queues a message published to `exchange` with `routing_key` lands in
    fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
            return Err(RabbitBridgeError::broker_error(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        };
        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        message: StoredMessage,
    ) -> Result<usize> {
        let targets = Self::route(state, exchange, &message.routing_key)?;
        if targets.is_empty() {
            debug!(
                "Dropping unroutable message {}/{}",
                exchange, message.routing_key
            );
        }
        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(state, target);
        }
        Ok(targets.len())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8], properties: MessageProperties) -> Result<()> {
        let mut state = self.state();
        let message = StoredMessage {
            body: body.to_vec(),
            properties,
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        self.enqueue(&mut state, exchange, message)?;
        Ok(())
    }

    /// Hand ready messages to consumers with spare prefetch capacity
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        loop {
            state.next_delivery_tag += 1;
            let delivery_tag = state.next_delivery_tag;

            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|index| queue.consumers[*index].has_capacity())
            else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let slot = &mut queue.consumers[index];
            let acker = MemoryAcker {
                broker: self.clone(),
                queue: queue_name.to_string(),
                consumer_tag: slot.tag.clone(),
                delivery_tag,
            };
            let delivery = Delivery::new(
                message.body.clone(),
                message.properties.clone(),
                message.routing_key.clone(),
                message.redelivered,
                Box::new(acker),
            );

            if slot.sender.send(Ok(delivery)).is_ok() {
                slot.unacked.insert(delivery_tag, message);
            } else {
                // consumer stream dropped: cancel it and keep the message
                queue.ready.push_front(message);
                let slot = queue.consumers.remove(index);
                queue.requeue_unacked(slot);
                queue.next_consumer = 0;
            }
        }
    }

    fn consume(
        &self,
        connection: u64,
        queue_name: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream> {
        let mut state = self.state();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Err(RabbitBridgeError::broker_error(format!(
                "NOT_FOUND - no queue '{queue_name}'"
            )));
        };
        Self::check_owner(queue, connection)?;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", uuid::Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };
        if queue.consumers.iter().any(|slot| slot.tag == tag) {
            return Err(RabbitBridgeError::broker_error(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            connection,
            prefetch,
            sender,
            unacked: HashMap::new(),
        });
        self.dispatch(&mut state, queue_name);

        let guard = ConsumerGuard {
            broker: self.clone(),
            queue: queue_name.to_string(),
            tag,
        };
        Ok(stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (delivery, (receiver, guard)))
        })
        .boxed())
    }

    fn cancel_consumer(&self, queue_name: &str, tag: &str) {
        let mut state = self.state();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(index) = queue.consumers.iter().position(|slot| slot.tag == tag) else {
            return;
        };
        let slot = queue.consumers.remove(index);
        queue.requeue_unacked(slot);
        queue.next_consumer = 0;

        if queue.spec.auto_delete && queue.consumers.is_empty() {
            Self::remove_queue(&mut state, queue_name);
        } else {
            self.dispatch(&mut state, queue_name);
        }
    }

    fn settle(&self, queue_name: &str, tag: &str, delivery_tag: u64, outcome: Settlement) -> Result<()> {
        let mut state = self.state();
        let message = state
            .queues
            .get_mut(queue_name)
            .and_then(|queue| queue.consumers.iter_mut().find(|slot| slot.tag == tag))
            .and_then(|slot| slot.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                RabbitBridgeError::broker_error(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))
            })?;

        match outcome {
            Settlement::Ack => {}
            Settlement::Requeue => {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    let mut message = message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            Settlement::Reject => self.dead_letter(&mut state, queue_name, message),
        }
        self.dispatch(&mut state, queue_name);
        Ok(())
    }

    fn dead_letter(&self, state: &mut BrokerState, queue_name: &str, mut message: StoredMessage) {
        let Some(spec) = state.queues.get(queue_name).map(|queue| queue.spec.clone()) else {
            return;
        };
        let Some(exchange) = spec.dead_letter_exchange() else {
            debug!("Discarding rejected message from {}", queue_name);
            return;
        };
        if let Some(routing_key) = spec.arguments.get(DEAD_LETTER_ROUTING_KEY_ARG) {
            message.routing_key = routing_key.clone();
        }
        message.redelivered = false;
        if let Err(e) = self.enqueue(state, exchange, message) {
            warn!("Dead-lettering from {} failed: {}", queue_name, e);
        }
    }
}

enum Settlement {
    Ack,
    Requeue,
    Reject,
}

/// Cancels the consumer when its delivery stream is dropped
struct ConsumerGuard {
    broker: MemoryBroker,
    queue: String,
    tag: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broker.cancel_consumer(&self.queue, &self.tag);
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    consumer_tag: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker
            .settle(&self.queue, &self.consumer_tag, self.delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.broker
            .settle(&self.queue, &self.consumer_tag, self.delivery_tag, outcome)
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// One connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    connection: Mutex<Option<u64>>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn connection_id(&self) -> Result<u64> {
        let connection = *lock_ignore_poison(&self.connection);
        match connection {
            Some(id) if self.broker.is_open(id) => Ok(id),
            _ => Err(RabbitBridgeError::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if self.connection_id().is_ok() {
            return Ok(());
        }
        let id = self.broker.open_connection()?;
        *lock_ignore_poison(&self.connection) = Some(id);
        info!("Connected to in-memory broker (connection {})", id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection_id().is_ok()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.connection_id()?;
        self.broker.declare_exchange(name, kind, durable)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let connection = self.connection_id()?;
        self.broker.declare_queue(connection, spec)
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let connection = self.connection_id()?;
        self.broker.bind(connection, queue, exchange, routing_key)
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.connection_id()?;
        self.broker.delete_exchange(name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let connection = self.connection_id()?;
        self.broker.delete_queue(connection, name)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.connection_id()?;
        self.broker.publish(exchange, routing_key, body, properties)
    }

    async fn consume(&self, queue: &str, prefetch: u16, consumer_tag: &str) -> Result<DeliveryStream> {
        let connection = self.connection_id()?;
        self.broker.consume(connection, queue, prefetch, consumer_tag)
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = lock_ignore_poison(&self.connection).take();
        if let Some(id) = connection {
            self.broker.close_connection(id);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(id) = lock_ignore_poison(&self.connection).take() {
            self.broker.close_connection(id);
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("connection", &*lock_ignore_poison(&self.connection))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(broker: &MemoryBroker) -> MemoryTransport {
        let transport = broker.transport();
        transport.connect().await.unwrap();
        transport
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("delivery in time")
            .expect("stream open")
            .expect("delivery ok")
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.line.added"));
        assert!(topic_matches("order.#", "order.line.added"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "basket.created"));
        assert!(!topic_matches("*.created", "basket.updated"));
    }

    #[tokio::test]
    async fn operations_fail_when_not_connected() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let err = transport
            .declare_queue(&QueueSpec::durable("orders.requests"))
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitBridgeError::NotConnected));

        broker.set_available(false);
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, RabbitBridgeError::Connection { .. }));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        transport
            .declare_queue(&QueueSpec::durable("orders.requests"))
            .await
            .unwrap();

        transport
            .publish("", "orders.requests", b"one", MessageProperties::json())
            .await
            .unwrap();
        // unroutable: silently dropped
        transport
            .publish("", "ghost.requests", b"two", MessageProperties::json())
            .await
            .unwrap();

        assert_eq!(broker.message_count("orders.requests"), 1);
        assert!(!broker.queue_exists("ghost.requests"));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        transport
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .unwrap();
        for body in [b"a", b"b"] {
            transport
                .publish("", "work", body, MessageProperties::json())
                .await
                .unwrap();
        }

        let mut stream = transport.consume("work", 1, "worker").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.body, b"a");
        assert_eq!(broker.message_count("work"), 1);
        assert_eq!(broker.unacked_count("work"), 1);

        first.ack().await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.body, b"b");
        second.ack().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 0);
        assert!(second.ack().await.is_err());
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        transport
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();
        transport
            .declare_exchange("events.dlx", ExchangeKind::Topic, true)
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::durable("orders.events").with_dead_letter_exchange("events.dlx"))
            .await
            .unwrap();
        transport
            .bind("orders.events", "events", "order.*")
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::durable("dlq"))
            .await
            .unwrap();
        transport.bind("dlq", "events.dlx", "#").await.unwrap();

        transport
            .publish("events", "order.created", b"{}", MessageProperties::json())
            .await
            .unwrap();
        let mut stream = transport.consume("orders.events", 1, "").await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.routing_key, "order.created");
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.message_count("orders.events"), 0);
        assert_eq!(broker.message_count("dlq"), 1);
    }

    #[tokio::test]
    async fn unacked_messages_return_when_connection_drops() {
        let broker = MemoryBroker::new();
        let publisher = connected(&broker).await;
        publisher
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .unwrap();
        publisher
            .publish("", "work", b"job", MessageProperties::json())
            .await
            .unwrap();

        let consumer = connected(&broker).await;
        let mut stream = consumer.consume("work", 1, "worker").await.unwrap();
        let delivery = next(&mut stream).await;
        assert!(!delivery.redelivered);

        consumer.disconnect().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.message_count("work"), 1);

        let again = connected(&broker).await;
        let mut stream = again.consume("work", 1, "worker").await.unwrap();
        assert!(next(&mut stream).await.redelivered);
    }

    #[tokio::test]
    async fn exclusive_queues_belong_to_their_connection() {
        let broker = MemoryBroker::new();
        let owner = connected(&broker).await;
        let other = connected(&broker).await;

        let name = owner
            .declare_queue(&QueueSpec::exclusive_temporary())
            .await
            .unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(other.consume(&name, 1, "").await.is_err());

        owner.disconnect().await.unwrap();
        assert!(!broker.queue_exists(&name));
        assert!(!owner.is_connected().await);
    }

    #[tokio::test]
    async fn redeclaring_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        transport
            .declare_queue(&QueueSpec::durable("orders.requests"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::durable("orders.requests"))
            .await
            .unwrap();
        let err = transport
            .declare_queue(&QueueSpec::durable("orders.requests").with_dead_letter_exchange("dlx"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }
}
