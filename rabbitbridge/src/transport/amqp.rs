use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    Acknowledger, Delivery, DeliveryStream, ExchangeKind, MessageProperties, QueueSpec, Transport,
    DEFAULT_EXCHANGE,
};
use crate::config::ConnectionConfig;
use crate::error::{RabbitBridgeError, Result};

const MAX_POOLED_CHANNELS: usize = 10;

/// RabbitMQ transport backed by lapin
///
/// Publishing and declarations share a small channel pool; every consumer
/// gets a dedicated channel because prefetch (QoS) is a per-channel setting.
pub struct AmqpTransport {
    config: ConnectionConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    channels: Mutex<Vec<Channel>>,
    consumer_channels: Mutex<Vec<Channel>>,
}

impl AmqpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channels: Mutex::new(Vec::new()),
            consumer_channels: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn try_connect(&self) -> Result<Connection> {
        debug!("Attempting to connect to {}", self.config.endpoint());

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("rabbitbridge-{}", uuid::Uuid::new_v4()).into());
        let url = self.config.amqp_url();
        let attempt = Connection::connect(&url, properties);

        match tokio::time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            attempt,
        )
        .await
        {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(RabbitBridgeError::Connection {
                endpoint: self.config.endpoint(),
                attempts: 1,
                reason: format!("timed out after {}ms", self.config.connection_timeout_ms),
            }),
        }
    }

    /// Current connection, if it is still open
    async fn live_connection(&self) -> Result<Arc<Connection>> {
        let guard = self.connection.read().await;
        match guard.as_ref() {
            Some(connection) if connection.status().connected() => Ok(connection.clone()),
            _ => Err(RabbitBridgeError::NotConnected),
        }
    }

    async fn get_channel(&self) -> Result<Channel> {
        {
            let mut channels = self.channels.lock().await;
            while let Some(channel) = channels.pop() {
                if channel.status().connected() {
                    return Ok(channel);
                }
            }
        }

        let connection = self.live_connection().await?;
        let channel = connection.create_channel().await?;
        debug!("Created new channel");
        Ok(channel)
    }

    async fn return_channel(&self, channel: Channel) {
        if channel.status().connected() {
            let mut channels = self.channels.lock().await;
            if channels.len() < MAX_POOLED_CHANNELS {
                channels.push(channel);
            }
        }
    }

    /// Run one operation on a pooled channel; a channel closed by a broker
    /// error is not returned to the pool
    async fn with_channel<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = lapin::Result<T>>,
    {
        let channel = self.get_channel().await?;
        let result = operation(channel.clone()).await;
        self.return_channel(channel).await;
        Ok(result?)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<()> {
        if self.live_connection().await.is_ok() {
            return Ok(());
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            match self.try_connect().await {
                Ok(connection) => {
                    info!("Connected to RabbitMQ at {}", self.config.endpoint());
                    *self.connection.write().await = Some(Arc::new(connection));
                    self.channels.lock().await.clear();
                    self.consumer_channels.lock().await.clear();
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        error!(
                            "Failed to connect to RabbitMQ after {} attempts: {}",
                            attempts, e
                        );
                        return Err(RabbitBridgeError::Connection {
                            endpoint: self.config.endpoint(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.live_connection().await.is_ok()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.with_channel(|channel| async move {
            channel
                .exchange_declare(
                    name,
                    kind.into(),
                    ExchangeDeclareOptions {
                        durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
        })
        .await?;
        debug!("Declared {} exchange: {}", kind, name);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let mut arguments = FieldTable::default();
        for (key, value) in &spec.arguments {
            arguments.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };

        let queue = self
            .with_channel(|channel| async move {
                channel.queue_declare(&spec.name, options, arguments).await
            })
            .await?;

        let name = queue.name().as_str().to_string();
        debug!("Declared queue: {}", name);
        Ok(name)
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            // Every queue is bound to the default exchange by its own name
            self.live_connection().await?;
            return Ok(());
        }

        self.with_channel(|channel| async move {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
        })
        .await?;
        debug!("Bound {} to {} with {}", queue, exchange, routing_key);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.with_channel(|channel| async move {
            channel
                .exchange_delete(name, ExchangeDeleteOptions::default())
                .await
        })
        .await?;
        debug!("Deleted exchange: {}", name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let purged = self
            .with_channel(|channel| async move {
                channel.queue_delete(name, QueueDeleteOptions::default()).await
            })
            .await?;
        debug!("Deleted queue {} ({} messages dropped)", name, purged);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        let properties = to_basic_properties(&properties);
        self.with_channel(|channel| async move {
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await?
                .await
        })
        .await?;
        debug!("Published message to {}/{}", exchange, routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16, consumer_tag: &str) -> Result<DeliveryStream> {
        let connection = self.live_connection().await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        {
            let mut consumers = self.consumer_channels.lock().await;
            consumers.retain(|consumer| consumer.status().connected());
            consumers.push(channel.clone());
        }

        debug!("Created consumer {} for queue: {}", consumer_tag, queue);
        let guard = ConsumerChannel(channel);
        Ok(consumer
            .map(move |delivery| {
                let _ = &guard;
                delivery.map(into_delivery).map_err(RabbitBridgeError::from)
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        let channels: Vec<Channel> = {
            let mut consumers = self.consumer_channels.lock().await;
            let mut pooled = self.channels.lock().await;
            consumers.drain(..).chain(pooled.drain(..)).collect()
        };
        for channel in channels {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "bye").await {
                    debug!("Ignoring channel close failure: {}", e);
                }
            }
        }

        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "bye").await {
                    warn!("Error while closing RabbitMQ connection: {}", e);
                }
            }
            info!("Disconnected from RabbitMQ at {}", self.config.endpoint());
        }
        Ok(())
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("endpoint", &self.config.endpoint())
            .finish()
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Closes a consumer's channel when its stream is dropped so that prefetched,
/// unacknowledged deliveries go back to the queue
struct ConsumerChannel(Channel);

impl Drop for ConsumerChannel {
    fn drop(&mut self) {
        if !self.0.status().connected() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.0.clone();
            runtime.spawn(async move {
                if let Err(e) = channel.close(200, "consumer cancelled").await {
                    debug!("Ignoring consumer channel close failure: {}", e);
                }
            });
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        data,
        properties,
        routing_key,
        redelivered,
        acker,
        ..
    } = delivery;

    Delivery::new(
        data,
        from_basic_properties(&properties),
        routing_key.as_str(),
        redelivered,
        Box::new(AmqpAcker(acker)),
    )
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(if properties.persistent {
        2
    } else {
        1
    });
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    basic
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        persistent: *properties.delivery_mode() == Some(2),
    }
}
