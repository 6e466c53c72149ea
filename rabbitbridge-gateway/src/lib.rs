//! # RabbitBridge Gateway
//!
//! HTTP front door for services reachable only through the broker. Every
//! `/api/{service}/{*path}` request becomes one RPC call to
//! `{service}.requests`; the service's response envelope becomes the HTTP
//! response.
//!
//! ```text
//! Client -> HTTP -> Gateway -> RabbitMQ -> {service}.requests -> RpcServer
//!                      ^                                            |
//!                 HTTP response <- reply queue <- ResponseEnvelope <-
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rabbitbridge::{ConnectionConfig, RpcClient};
//! use rabbitbridge_gateway::{create_router, GatewayState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = RpcClient::connect("api-gateway", ConnectionConfig::from_env()?).await?;
//!     let app = create_router(GatewayState::new(Arc::new(client), Duration::from_secs(30)));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod router;

pub use crate::config::Settings;
pub use router::{create_router, GatewayError, GatewayState};
