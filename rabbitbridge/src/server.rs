//! RPC server: consumes `{service}.requests`, dispatches locally and replies.
//!
//! Each consumer holds at most one unacknowledged request (prefetch 1), so a
//! single consumer handles requests strictly in queue order. Throughput is
//! scaled with [`ServerConfig::consumer_count`] competing consumers.
//!
//! Every request is acknowledged after its response has been published,
//! whether the handler succeeded or not. Failed requests are answered with a
//! 500 response instead of being redelivered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{RabbitBridgeError, Result};
use crate::message::{RequestEnvelope, ResponseEnvelope};
use crate::topology::request_queue_spec;
use crate::transport::{Delivery, DeliveryStream, MessageProperties, Transport, DEFAULT_EXCHANGE};

/// Unacknowledged requests each consumer may hold
pub const SERVER_PREFETCH: u16 = 1;

/// Server tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Competing consumers on the request queue
    pub consumer_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { consumer_count: 1 }
    }
}

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connected,
    Listening,
    Stopped,
}

enum ConsumerExit {
    Stopped,
    StreamClosed,
}

/// Serves one service's request queue
pub struct RpcServer {
    service_name: String,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    config: ServerConfig,
    state: watch::Sender<ServerState>,
    stop: watch::Sender<bool>,
}

impl RpcServer {
    pub fn new(
        service_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
        config: ServerConfig,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            transport,
            dispatcher,
            config,
            state: watch::Sender::new(ServerState::Disconnected),
            stop: watch::Sender::new(false),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Resolves once the consumers are attached to the request queue
    pub async fn wait_until_listening(&self) {
        let mut state = self.state.subscribe();
        while *state.borrow_and_update() != ServerState::Listening {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serve requests until [`stop_listening`](Self::stop_listening) is called
    ///
    /// Returns `Ok(())` after a requested stop. Losing the broker connection
    /// ends the call with [`RabbitBridgeError::NotConnected`]; the caller may
    /// start listening again once the broker is back.
    pub async fn start_listening(&self) -> Result<()> {
        if !self.transport.is_connected().await {
            self.state.send_replace(ServerState::Disconnected);
            self.transport.connect().await?;
        }
        self.state.send_replace(ServerState::Connected);

        let queue = self
            .transport
            .declare_queue(&request_queue_spec(&self.service_name))
            .await?;
        self.stop.send_replace(false);

        let consumer_count = self.config.consumer_count.max(1);
        let mut consumers = Vec::with_capacity(consumer_count);
        for index in 0..consumer_count {
            let consumer_tag = format!("{}-rpc-{}-{}", self.service_name, index, Uuid::new_v4().simple());
            let stream = match self.transport.consume(&queue, SERVER_PREFETCH, &consumer_tag).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.stop.send_replace(true);
                    return Err(e);
                }
            };
            consumers.push(tokio::spawn(serve_requests(
                stream,
                self.transport.clone(),
                self.dispatcher.clone(),
                self.service_name.clone(),
                self.stop.subscribe(),
            )));
        }

        self.state.send_replace(ServerState::Listening);
        info!(
            "RPC server {} listening on {} with {} consumer(s), dispatching via {}",
            self.service_name,
            queue,
            consumer_count,
            self.dispatcher.name()
        );

        let mut outcome = Ok(());
        for consumer in consumers {
            match consumer.await {
                Ok(ConsumerExit::Stopped) => {}
                Ok(ConsumerExit::StreamClosed) => outcome = Err(RabbitBridgeError::NotConnected),
                Err(e) => outcome = Err(RabbitBridgeError::from(e)),
            }
        }

        if *self.stop.borrow() {
            self.state.send_replace(ServerState::Stopped);
            info!("RPC server {} stopped", self.service_name);
            Ok(())
        } else {
            self.state.send_replace(ServerState::Disconnected);
            warn!("RPC server {} lost its request consumers", self.service_name);
            outcome.and(Err(RabbitBridgeError::NotConnected))
        }
    }

    /// Ask every consumer to stop taking new requests
    ///
    /// A request already being handled is finished and acknowledged first.
    pub fn stop_listening(&self) {
        info!("Stopping RPC server {}", self.service_name);
        self.stop.send_replace(true);
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

async fn serve_requests(
    mut stream: DeliveryStream,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    service_name: String,
    mut stop: watch::Receiver<bool>,
) -> ConsumerExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => return ConsumerExit::Stopped,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                process_delivery(&delivery, transport.as_ref(), dispatcher.as_ref(), &service_name).await;
            }
            Some(Err(e)) => error!("Error receiving request for {}: {}", service_name, e),
            None => return ConsumerExit::StreamClosed,
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Decode, dispatch, reply, then acknowledge one request
async fn process_delivery(
    delivery: &Delivery,
    transport: &dyn Transport,
    dispatcher: &dyn Dispatcher,
    service_name: &str,
) {
    let started = Instant::now();
    let response = match RequestEnvelope::from_bytes(&delivery.body) {
        Ok(request) => {
            debug!(
                "Processing {} {} on {} (queued {}ms)",
                request.method,
                request.path,
                service_name,
                request.age_ms()
            );
            let response = dispatch_guarded(dispatcher, &request).await;
            debug!(
                "{} {} answered {} in {:?}",
                request.method,
                request.path,
                response.status,
                started.elapsed()
            );
            response
        }
        Err(e) => {
            warn!("Undecodable request on {}: {}", service_name, e);
            ResponseEnvelope::error(500, e.to_string())
        }
    };

    match (&delivery.properties.reply_to, &delivery.properties.correlation_id) {
        (Some(reply_to), Some(correlation_id)) => {
            if let Err(e) = reply(transport, reply_to, correlation_id, &response).await {
                error!("Failed to publish reply to {}: {}", reply_to, e);
            }
        }
        _ => debug!("Request on {} carries no reply address; not replying", service_name),
    }

    if let Err(e) = delivery.ack().await {
        error!("Failed to acknowledge request on {}: {}", service_name, e);
    }
}

/// Run the dispatcher, turning errors and panics into 500 responses
async fn dispatch_guarded(dispatcher: &dyn Dispatcher, request: &RequestEnvelope) -> ResponseEnvelope {
    match AssertUnwindSafe(dispatcher.dispatch(request)).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!("Handler for {} {} failed: {}", request.method, request.path, e);
            let message = match e {
                RabbitBridgeError::Handler(message) => message,
                other => other.to_string(),
            };
            ResponseEnvelope::error(500, message)
        }
        Err(_) => {
            error!("Handler for {} {} panicked", request.method, request.path);
            ResponseEnvelope::error(500, "handler panicked")
        }
    }
}

async fn reply(
    transport: &dyn Transport,
    reply_to: &str,
    correlation_id: &str,
    response: &ResponseEnvelope,
) -> Result<()> {
    let body = response.to_bytes()?;
    transport
        .publish(
            DEFAULT_EXCHANGE,
            reply_to,
            &body,
            MessageProperties::json().with_correlation_id(correlation_id),
        )
        .await
}
