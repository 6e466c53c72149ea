use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{RabbitBridgeError, Result};

/// Request published to `{service}.requests`
///
/// Correlation id and reply queue travel as message properties, not in the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    /// Logical verb ("get", "post", ...)
    pub method: String,
    /// Route within the target service, e.g. `orders/42`
    pub path: String,
    /// Payload, a JSON object
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Propagated context (authorization, trace id, ...)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            data: empty_object(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Add one propagated header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Deserialize the payload into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an inbound request body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RabbitBridgeError::InvalidMessage {
            reason: e.to_string(),
        })
    }

    /// Age of the request in milliseconds
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

/// Response published back to the request's `reply_to` queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Result body, or `{"error": ...}` for failures
    pub data: Value,
    /// HTTP-like status code
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResponseEnvelope {
    pub fn new(data: Value, status: u16, headers: HashMap<String, String>) -> Self {
        Self {
            data,
            status,
            headers,
        }
    }

    /// 200 response carrying `data`
    pub fn ok(data: Value) -> Self {
        Self::new(data, 200, HashMap::new())
    }

    /// Successful response from any serializable value
    pub fn success(data: impl Serialize, status: u16) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(data)?, status, HashMap::new()))
    }

    /// Failure response with an `{"error": message}` body
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(json!({ "error": message.into() }), status, HashMap::new())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error message of a failure body, if any
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    /// Deserialize the body into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a reply body; failures surface as `InvalidResponse`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RabbitBridgeError::InvalidResponse {
            reason: e.to_string(),
        })
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
