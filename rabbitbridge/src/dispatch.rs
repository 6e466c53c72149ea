//! Local request dispatch.
//!
//! A [`Dispatcher`] turns a decoded [`RequestEnvelope`] into a
//! [`ResponseEnvelope`]. The RPC server does not care how: services either
//! register in-process handlers on a [`RouteTable`] or put an
//! [`HttpForwarder`] in front of their existing HTTP API.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RabbitBridgeError, Result};
use crate::message::{RequestEnvelope, ResponseEnvelope};

/// Produces a response for one request
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope>;

    /// Dispatcher name for logs
    fn name(&self) -> &'static str {
        "Dispatcher"
    }
}

/// Values captured from `{name}` segments of a route pattern
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(HashMap<String, String>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Parse a captured value, failing with a handler error when missing or malformed
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<T> {
        self.get(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| RabbitBridgeError::handler_error(format!("invalid path parameter '{name}'")))
    }
}

/// Type alias for async route handlers
pub type HandlerFn =
    Arc<dyn Fn(RequestEnvelope, RouteParams) -> BoxFuture<'static, Result<ResponseEnvelope>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Route {
    method: String,
    segments: Vec<Segment>,
    handler: HandlerFn,
}

impl Route {
    fn capture(&self, parts: &[&str]) -> Option<RouteParams> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(RouteParams(params))
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
        .collect()
}

/// In-process handlers keyed by `(method, path pattern)`
///
/// Patterns are slash-separated; `{name}` segments match any single segment.
/// Unknown paths answer 404 and known paths with another method answer 405.
///
/// ```rust
/// use rabbitbridge::{RouteTable, ResponseEnvelope};
/// use serde_json::json;
///
/// let routes = RouteTable::new("orders").route("get", "orders/{id}", |_request, params| async move {
///     let id: u64 = params.parse("id")?;
///     Ok(ResponseEnvelope::ok(json!({ "id": id })))
/// });
/// assert_eq!(routes.len(), 1);
/// ```
pub struct RouteTable {
    service_name: String,
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            routes: Vec::new(),
        }
    }

    /// Register a handler for `method` on `pattern`
    pub fn route<F, Fut>(mut self, method: &str, pattern: &str, handler: F) -> Self
    where
        F: Fn(RequestEnvelope, RouteParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseEnvelope>> + Send + 'static,
    {
        let segments = split_path(pattern)
            .into_iter()
            .map(|part| match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(part.to_string()),
            })
            .collect();
        self.routes.push(Route {
            method: method.to_lowercase(),
            segments,
            handler: Arc::new(move |request, params| handler(request, params).boxed()),
        });
        info!(
            "Registered route {} {} on {}",
            method.to_lowercase(),
            pattern,
            self.service_name
        );
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl Dispatcher for RouteTable {
    async fn dispatch(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let parts = split_path(&request.path);
        let method = request.method.to_lowercase();
        let mut path_known = false;

        for route in &self.routes {
            let Some(params) = route.capture(&parts) else {
                continue;
            };
            if route.method != method {
                path_known = true;
                continue;
            }
            return (route.handler)(request.clone(), params).await;
        }

        if path_known {
            Ok(ResponseEnvelope::error(
                405,
                format!("method {} not allowed on {}", method, request.path),
            ))
        } else {
            Ok(ResponseEnvelope::error(
                404,
                format!("no route for {} {}", method, request.path),
            ))
        }
    }

    fn name(&self) -> &'static str {
        "RouteTable"
    }
}

/// Headers that describe one HTTP hop and must not be copied across
const HOP_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "keep-alive",
    "content-length",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Forwards each request to the service's own HTTP API at `{base_url}/api/{path}`
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpForwarder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Flatten a JSON object into query pairs; strings are passed verbatim
fn query_pairs(data: &Value) -> Vec<(String, String)> {
    match data {
        Value::Object(map) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Dispatcher for HttpForwarder {
    async fn dispatch(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let method = Method::from_str(&request.method.to_uppercase()).map_err(|_| {
            RabbitBridgeError::handler_error(format!("unsupported method '{}'", request.method))
        })?;
        let url = self.url_for(&request.path);
        debug!("Forwarding {} {}", method, url);

        let mut builder = self.client.request(method.clone(), &url);
        for (name, value) in request.headers.iter().filter(|(name, _)| !is_hop_header(name)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = if method == Method::GET || method == Method::DELETE || method == Method::HEAD {
            builder.query(&query_pairs(&request.data))
        } else {
            builder.json(&request.data)
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_header(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        let data = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        };
        Ok(ResponseEnvelope::new(data, status, headers))
    }

    fn name(&self) -> &'static str {
        "HttpForwarder"
    }
}
