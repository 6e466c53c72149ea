//! # RabbitBridge - synchronous RPC over RabbitMQ
//!
//! RabbitBridge lets services call each other with request/response
//! semantics while every byte travels through the message broker. A caller
//! publishes a [`RequestEnvelope`] to `{service}.requests` with a correlation
//! id and a private reply queue; the target's [`RpcServer`] dispatches it
//! locally and publishes a [`ResponseEnvelope`] back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rabbitbridge::{AmqpTransport, ConnectionConfig, ResponseEnvelope, RouteTable, RpcServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> rabbitbridge::Result<()> {
//!     let transport = Arc::new(AmqpTransport::new(ConnectionConfig::from_env()?));
//!     let routes = RouteTable::new("orders").route("get", "orders/{id}", |_request, params| async move {
//!         let id: u64 = params.parse("id")?;
//!         Ok(ResponseEnvelope::ok(serde_json::json!({ "id": id })))
//!     });
//!
//!     let server = RpcServer::new("orders", transport, Arc::new(routes), ServerConfig::default());
//!     server.start_listening().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod server;
pub mod topology;
pub mod transport;

pub use client::{ClientStats, RpcClient};
pub use crate::config::ConnectionConfig;
pub use dispatch::{Dispatcher, HttpForwarder, RouteParams, RouteTable};
pub use error::{RabbitBridgeError, Result};
pub use message::{RequestEnvelope, ResponseEnvelope};
pub use server::{RpcServer, ServerConfig, ServerState};
pub use topology::{setup_topology, EventQueue, TopologySpec};
pub use transport::{AmqpTransport, MemoryBroker, MemoryTransport, Transport};
