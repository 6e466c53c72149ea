//! Exchange/queue/binding graph shared by every service.
//!
//! ```text
//! default exchange ──{service}.requests──▶ {service}.requests   (RPC)
//! microservices (topic) ──patterns──▶ {domain}.events ──dlx──▶ microservices.dlx ──#──▶ dead_letter_queue
//! ```

use tracing::{debug, info};

use crate::error::{RabbitBridgeError, Result};
use crate::transport::{ExchangeKind, QueueSpec, Transport};

/// Topic exchange carrying domain events
pub const EVENTS_EXCHANGE: &str = "microservices";
/// Topic exchange receiving dead-lettered messages
pub const DEAD_LETTER_EXCHANGE: &str = "microservices.dlx";
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";

/// `{service}.requests`
pub fn request_queue_name(service: &str) -> String {
    format!("{service}.requests")
}

/// `{domain}.events`
pub fn event_queue_name(domain: &str) -> String {
    format!("{domain}.events")
}

/// Declaration of a service's RPC request queue
pub fn request_queue_spec(service: &str) -> QueueSpec {
    QueueSpec::durable(request_queue_name(service)).with_dead_letter_exchange(DEAD_LETTER_EXCHANGE)
}

/// An event queue and the routing-key patterns feeding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQueue {
    pub domain: String,
    pub patterns: Vec<String>,
}

impl EventQueue {
    pub fn new<I, S>(domain: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain: domain.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn queue_name(&self) -> String {
        event_queue_name(&self.domain)
    }

    fn queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(self.queue_name()).with_dead_letter_exchange(DEAD_LETTER_EXCHANGE)
    }
}

/// Every service and event queue to declare
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySpec {
    pub services: Vec<String>,
    pub event_queues: Vec<EventQueue>,
}

impl TopologySpec {
    /// The shop's services and event domains
    pub fn ecommerce() -> Self {
        let services = [
            "addresses",
            "baskets",
            "products",
            "orders",
            "deliveries",
            "contacts",
            "newsletters",
            "sav",
            "questions",
        ];
        Self {
            services: services.iter().map(|s| s.to_string()).collect(),
            event_queues: vec![
                EventQueue::new("addresses", ["address.*"]),
                EventQueue::new("baskets", ["basket.*"]),
                EventQueue::new("products", ["product.*", "category.*", "tag.*"]),
                EventQueue::new("orders", ["order.*", "payment.*"]),
                EventQueue::new("deliveries", ["delivery.*", "order.shipped"]),
                EventQueue::new("contacts", ["contact.*"]),
                EventQueue::new("newsletters", ["newsletter.*", "campaign.*"]),
                EventQueue::new("sav", ["sav.*", "ticket.*"]),
                EventQueue::new("questions", ["question.*"]),
            ],
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_event_queue(mut self, queue: EventQueue) -> Self {
        self.event_queues.push(queue);
        self
    }

    /// Every queue this topology declares
    pub fn queue_names(&self) -> Vec<String> {
        self.event_queues
            .iter()
            .map(EventQueue::queue_name)
            .chain(self.services.iter().map(|s| request_queue_name(s)))
            .chain(std::iter::once(DEAD_LETTER_QUEUE.to_string()))
            .collect()
    }
}

/// Declare the whole graph; with `force`, delete every queue and exchange first
///
/// Without `force` the call is idempotent: redeclaring identical entities is a
/// no-op on the broker.
pub async fn setup_topology(transport: &dyn Transport, spec: &TopologySpec, force: bool) -> Result<()> {
    transport
        .connect()
        .await
        .map_err(|e| RabbitBridgeError::topology("connecting", e))?;

    if force {
        info!("Force mode: deleting existing queues and exchanges");
        for queue in spec.queue_names() {
            if let Err(e) = transport.delete_queue(&queue).await {
                debug!("Ignoring failure deleting queue {}: {}", queue, e);
            }
        }
        for exchange in [EVENTS_EXCHANGE, DEAD_LETTER_EXCHANGE] {
            if let Err(e) = transport.delete_exchange(exchange).await {
                debug!("Ignoring failure deleting exchange {}: {}", exchange, e);
            }
        }
    }

    for exchange in [EVENTS_EXCHANGE, DEAD_LETTER_EXCHANGE] {
        transport
            .declare_exchange(exchange, ExchangeKind::Topic, true)
            .await
            .map_err(|e| RabbitBridgeError::topology(format!("declaring exchange {exchange}"), e))?;
    }

    for service in &spec.services {
        let queue = transport
            .declare_queue(&request_queue_spec(service))
            .await
            .map_err(|e| RabbitBridgeError::topology(format!("declaring request queue for {service}"), e))?;
        debug!("Request queue ready: {}", queue);
    }

    for events in &spec.event_queues {
        let queue = transport
            .declare_queue(&events.queue_spec())
            .await
            .map_err(|e| RabbitBridgeError::topology(format!("declaring event queue {}", events.queue_name()), e))?;
        for pattern in &events.patterns {
            transport
                .bind(&queue, EVENTS_EXCHANGE, pattern)
                .await
                .map_err(|e| RabbitBridgeError::topology(format!("binding {queue} to {pattern}"), e))?;
        }
    }

    transport
        .declare_queue(&QueueSpec::durable(DEAD_LETTER_QUEUE))
        .await
        .map_err(|e| RabbitBridgeError::topology("declaring dead letter queue", e))?;
    transport
        .bind(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, "#")
        .await
        .map_err(|e| RabbitBridgeError::topology("binding dead letter queue", e))?;

    info!(
        "Topology ready: {} request queues, {} event queues",
        spec.services.len(),
        spec.event_queues.len()
    );
    Ok(())
}
