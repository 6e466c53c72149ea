use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{RabbitBridgeError, Result};
use crate::message::{RequestEnvelope, ResponseEnvelope};
use crate::topology::request_queue_name;
use crate::transport::{
    AmqpTransport, DeliveryStream, MessageProperties, QueueSpec, Transport, DEFAULT_EXCHANGE,
};

/// Unlimited prefetch on the private reply queue
const REPLY_PREFETCH: u16 = 0;

/// Correlation id → waiting caller
///
/// Each call owns the receiving half of its own oneshot channel; the map only
/// holds the sending halves so the reply consumer can route bodies to them.
#[derive(Default)]
struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Vec<u8>>>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a fresh, unused correlation id
    fn register(&self) -> (String, oneshot::Receiver<Vec<u8>>) {
        let mut calls = self.lock();
        loop {
            let correlation_id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = calls.entry(correlation_id.clone()) {
                let (sender, receiver) = oneshot::channel();
                slot.insert(sender);
                return (correlation_id, receiver);
            }
        }
    }

    /// Hand a reply body to its caller; false when nobody waits for it
    fn resolve(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        let sender = self.lock().remove(correlation_id);
        match sender {
            Some(sender) => sender.send(body).is_ok(),
            None => false,
        }
    }

    fn remove(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Deregisters a pending call however the waiting future ends
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

struct ReplyQueue {
    name: String,
    task: JoinHandle<()>,
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Synchronous request/response calls to other services over the broker
///
/// One private reply queue serves every call made through the client; replies
/// are demultiplexed by correlation id, so any number of calls may be in
/// flight at once.
///
/// ```rust,no_run
/// # use rabbitbridge::{RpcClient, ConnectionConfig};
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() -> rabbitbridge::Result<()> {
/// let client = RpcClient::connect("api-gateway", ConnectionConfig::from_env()?).await?;
/// let response = client
///     .send_request("orders", "get", "orders/42", serde_json::json!({}), Default::default(), Duration::from_secs(5))
///     .await?;
/// assert_eq!(response.status, 200);
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    client_name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCalls>,
    reply: tokio::sync::Mutex<Option<ReplyQueue>>,
}

impl RpcClient {
    /// Create a client over an existing transport; connects lazily
    pub fn new(client_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            client_name: client_name.into(),
            transport,
            pending: Arc::new(PendingCalls::default()),
            reply: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a client with its own RabbitMQ connection
    pub async fn connect(client_name: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        let client = Self::new(client_name, Arc::new(AmqpTransport::new(config)));
        info!("Creating RPC client: {}", client.client_name);
        client.prepare().await?;
        info!("RPC client ready: {}", client.client_name);
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.client_name
    }

    /// Call `method path` on `service` and wait up to `timeout` for its reply
    pub async fn send_request(
        &self,
        service: &str,
        method: &str,
        path: &str,
        data: Value,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope> {
        let request = RequestEnvelope::new(method, path)
            .with_data(data)
            .with_headers(headers);
        self.request(service, &request, timeout).await
    }

    /// Send a prepared envelope to `service` and wait for its reply
    pub async fn request(
        &self,
        service: &str,
        request: &RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope> {
        if service.trim().is_empty() {
            return Err(RabbitBridgeError::invalid_request("service name is empty"));
        }
        if timeout.is_zero() {
            return Err(RabbitBridgeError::invalid_request("timeout must be positive"));
        }

        let reply_to = self.prepare().await?;
        let body = request.to_bytes()?;

        let (correlation_id, receiver) = self.pending.register();
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let properties = MessageProperties::json()
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply_to)
            .persistent(false);
        self.transport
            .publish(DEFAULT_EXCHANGE, &request_queue_name(service), &body, properties)
            .await?;

        debug!(
            "Sent {} {} to {} (correlation_id: {})",
            request.method, request.path, service, correlation_id
        );

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(body)) => ResponseEnvelope::from_bytes(&body).map_err(|e| {
                error!(
                    "Undecodable reply from {} (correlation_id: {}): {}",
                    service, correlation_id, e
                );
                e
            }),
            Ok(Err(_)) => {
                warn!("Client {} closed while waiting on {}", self.client_name, service);
                Err(RabbitBridgeError::NotConnected)
            }
            Err(_) => {
                warn!(
                    "No reply from {} within {:?} (correlation_id: {})",
                    service, timeout, correlation_id
                );
                Err(RabbitBridgeError::timeout(service, timeout))
            }
        }
    }

    /// Fire-and-forget persistent event on `exchange`
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &impl Serialize,
    ) -> Result<()> {
        {
            let mut reply = self.reply.lock().await;
            self.ensure_connected(&mut reply).await?;
        }

        let body = serde_json::to_vec(data)?;
        let properties = MessageProperties::json().persistent(true);
        self.transport
            .publish(exchange, routing_key, &body, properties)
            .await?;
        debug!("Published event {} on {}", routing_key, exchange);
        Ok(())
    }

    /// Number of calls currently waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub async fn is_healthy(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Stop the reply consumer, fail waiting calls and close the connection
    pub async fn close(&self) -> Result<()> {
        self.reply.lock().await.take();
        self.pending.clear();
        self.transport.disconnect().await?;
        info!("RPC client {} closed", self.client_name);
        Ok(())
    }

    pub async fn get_stats(&self) -> ClientStats {
        let reply_queue = self.reply.lock().await.as_ref().map(|r| r.name.clone());
        ClientStats {
            client_name: self.client_name.clone(),
            connected: self.transport.is_connected().await,
            reply_queue,
            pending_calls: self.pending.len(),
        }
    }

    async fn ensure_connected(&self, reply: &mut Option<ReplyQueue>) -> Result<()> {
        if self.transport.is_connected().await {
            return Ok(());
        }
        // the exclusive reply queue died with the previous connection
        reply.take();
        self.transport.connect().await
    }

    /// Connect if needed and return the live reply queue name
    async fn prepare(&self) -> Result<String> {
        let mut reply = self.reply.lock().await;
        self.ensure_connected(&mut reply).await?;

        if let Some(existing) = reply.as_ref() {
            if !existing.task.is_finished() {
                return Ok(existing.name.clone());
            }
        }

        let name = self
            .transport
            .declare_queue(&QueueSpec::exclusive_temporary())
            .await?;
        let consumer_tag = format!("{}-replies-{}", self.client_name, Uuid::new_v4().simple());
        let stream = self
            .transport
            .consume(&name, REPLY_PREFETCH, &consumer_tag)
            .await?;
        let task = tokio::spawn(route_replies(
            stream,
            self.pending.clone(),
            self.client_name.clone(),
        ));

        debug!("Client {} listening for replies on {}", self.client_name, name);
        *reply = Some(ReplyQueue {
            name: name.clone(),
            task,
        });
        Ok(name)
    }
}

/// Route each reply to the call waiting on its correlation id
async fn route_replies(mut stream: DeliveryStream, pending: Arc<PendingCalls>, client_name: String) {
    while let Some(delivery) = stream.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Error receiving reply for {}: {}", client_name, e);
                continue;
            }
        };

        if let Err(e) = delivery.ack().await {
            error!("Failed to acknowledge reply: {}", e);
        }

        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            warn!("Discarding reply without correlation_id");
            continue;
        };
        if pending.resolve(&correlation_id, delivery.body) {
            debug!("Routed reply for correlation_id: {}", correlation_id);
        } else {
            warn!(
                "Discarding reply for unknown correlation_id: {}",
                correlation_id
            );
        }
    }
    debug!("Reply consumer for {} stopped", client_name);
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("client_name", &self.client_name)
            .field("pending_calls", &self.pending.len())
            .finish()
    }
}

/// Client statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_name: String,
    pub connected: bool,
    pub reply_queue: Option<String>,
    pub pending_calls: usize,
}
