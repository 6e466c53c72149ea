use std::time::Duration;

use thiserror::Error;

/// Result type alias for rabbitbridge operations
pub type Result<T> = std::result::Result<T, RabbitBridgeError>;

/// Error types for the broker transport, the RPC client and the RPC server
#[derive(Error, Debug)]
pub enum RabbitBridgeError {
    /// Errors reported by the AMQP client library
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker could not be reached within the allowed attempts
    #[error("cannot connect to broker at {endpoint} after {attempts} attempt(s): {reason}")]
    Connection {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// An operation was attempted without a live broker connection
    #[error("not connected to the broker")]
    NotConnected,

    /// No reply arrived before the caller's deadline
    #[error("no response from {service} within {timeout_secs}s")]
    RequestTimeout { service: String, timeout_secs: f64 },

    /// A reply arrived but its body could not be decoded
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// An inbound request could not be decoded
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Caller supplied arguments that cannot be sent
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Local dispatch failed while processing a request
    #[error("handler error: {0}")]
    Handler(String),

    /// Broker-side refusal (in-process broker and precondition failures)
    #[error("broker error: {0}")]
    Broker(String),

    /// Exchange/queue/binding declaration failed during setup
    #[error("topology error while {operation}: {reason}")]
    Topology { operation: String, reason: String },

    /// Message serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local HTTP dispatch errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tokio join errors
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RabbitBridgeError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    pub fn invalid_request<T: ToString>(reason: T) -> Self {
        Self::InvalidRequest {
            reason: reason.to_string(),
        }
    }

    pub fn timeout(service: impl Into<String>, timeout: Duration) -> Self {
        Self::RequestTimeout {
            service: service.into(),
            timeout_secs: timeout.as_secs_f64(),
        }
    }

    /// Wrap any error raised while declaring topology
    pub fn topology(operation: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Topology {
            operation: operation.into(),
            reason: source.to_string(),
        }
    }

    /// Check if error is recoverable (the caller may reconnect or retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Amqp(_)
                | Self::Connection { .. }
                | Self::NotConnected
                | Self::RequestTimeout { .. }
                | Self::Io(_)
        )
    }

    /// True for faults of the broker connection itself
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Amqp(_) | Self::Connection { .. } | Self::NotConnected | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_service_and_window() {
        let err = RabbitBridgeError::timeout("orders", Duration::from_secs(2));
        assert_eq!(err.to_string(), "no response from orders within 2s");
        assert!(err.is_recoverable());
        assert!(!err.is_connection_fault());
    }

    #[test]
    fn handler_errors_are_not_recoverable() {
        let err = RabbitBridgeError::handler_error("boom");
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "handler error: boom");
    }
}
