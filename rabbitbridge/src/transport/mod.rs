//! Broker transport abstraction.
//!
//! A [`Transport`] owns one broker connection and exposes the handful of AMQP
//! primitives the RPC layers need: topology declaration, publish, and
//! manually acknowledged consumption. Two implementations exist:
//!
//! - [`AmqpTransport`] talks to RabbitMQ through lapin.
//! - [`MemoryTransport`] connects to an in-process [`MemoryBroker`] with the
//!   same routing, prefetch, ack and dead-letter behaviour. Tests and local
//!   development use it.
//!
//! The transport never reconnects by itself. Once the connection is gone every
//! operation fails with [`RabbitBridgeError::NotConnected`] until the owner
//! calls [`Transport::connect`] again.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

/// Name of the AMQP default (nameless direct) exchange
pub const DEFAULT_EXCHANGE: &str = "";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Queue argument naming the dead-letter exchange
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key used when dead-lettering
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Exchange routing strategies used by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Topic => f.write_str("topic"),
            Self::Fanout => f.write_str("fanout"),
        }
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; empty asks the broker to generate one
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// String-valued queue arguments (`x-dead-letter-exchange`, ...)
    pub arguments: BTreeMap<String, String>,
}

impl QueueSpec {
    /// Durable, shared queue
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }

    /// Broker-named, non-durable, exclusive, auto-deleting queue (reply queues)
    pub fn exclusive_temporary() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            arguments: BTreeMap::new(),
        }
    }

    /// Route rejected, expired and nacked messages to `exchange`
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.arguments
            .insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.arguments
            .insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), routing_key.into());
        self
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments.get(DEAD_LETTER_EXCHANGE_ARG).map(String::as_str)
    }
}

/// The subset of AMQP basic properties the bridge reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Delivery mode 2 when true, 1 otherwise
    pub persistent: bool,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Settles a delivery with the broker it came from
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer; must be settled with [`Delivery::ack`] or
/// [`Delivery::nack`]
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            properties,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer; ends when the consumer is cancelled
/// or the connection closes
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Connection-owning broker client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection; no-op when already connected
    async fn connect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Declare a queue and return its (possibly broker-generated) name
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Bind `queue` to `exchange`; binding to the default exchange is implicit
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start a manually acknowledged consumer holding at most `prefetch`
    /// unacknowledged deliveries
    async fn consume(&self, queue: &str, prefetch: u16, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close consumers, channels and the connection; safe to call repeatedly
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_arguments_are_recorded() {
        let spec = QueueSpec::durable("orders.events")
            .with_dead_letter_exchange("microservices.dlx")
            .with_dead_letter_routing_key("orders.dead");
        assert_eq!(spec.dead_letter_exchange(), Some("microservices.dlx"));
        assert_eq!(
            spec.arguments.get(DEAD_LETTER_ROUTING_KEY_ARG).map(String::as_str),
            Some("orders.dead")
        );
    }

    #[test]
    fn reply_queue_spec_is_private() {
        let spec = QueueSpec::exclusive_temporary();
        assert!(spec.name.is_empty());
        assert!(spec.exclusive && spec.auto_delete && !spec.durable);
    }
}
