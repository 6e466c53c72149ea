use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use rabbitbridge::{RabbitBridgeError, ResponseEnvelope, RpcClient};

/// Headers that only describe the inbound HTTP hop
const HOP_HEADERS: [&str; 7] = [
    "host",
    "connection",
    "keep-alive",
    "content-length",
    "content-type",
    "transfer-encoding",
    "upgrade",
];

/// Gateway state containing the RPC client used for every call
#[derive(Debug, Clone)]
pub struct GatewayState {
    /// Client for calling services through the broker
    pub client: Arc<RpcClient>,
    /// Deadline applied to every RPC call
    pub timeout: Duration,
}

impl GatewayState {
    pub fn new(client: Arc<RpcClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

/// Router exposing `/health` and `/api/{service}/{*path}`
///
/// ```text
/// GET /api/orders/orders/42?expand=lines
///   -> RPC to orders.requests: method "get", path "orders/42", data {"expand": "lines"}
///   <- ResponseEnvelope { status, data, headers } as the HTTP response
/// ```
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/{service}/{*path}", any(handle_rpc_call))
        .with_state(state)
}

async fn handle_rpc_call(
    State(state): State<GatewayState>,
    method: Method,
    Path((service, path)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let method = method.as_str().to_lowercase();
    debug!("RPC call: {} {} on {}", method, path, service);

    let data = merge_params(query, &body)?;
    let response = state
        .client
        .send_request(
            &service,
            &method,
            &path,
            data,
            forwarded_headers(&headers),
            state.timeout,
        )
        .await
        .map_err(|source| GatewayError::Rpc {
            service: service.clone(),
            source,
        })?;

    if !response.is_success() {
        warn!("{} {} on {} answered {}", method, path, service, response.status);
    }
    Ok(into_http_response(response))
}

/// Query parameters first, then body fields on top
fn merge_params(query: HashMap<String, String>, body: &[u8]) -> Result<Value, GatewayError> {
    let mut params = Map::new();
    for (key, value) in query {
        let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
        params.insert(key, parsed);
    }

    if !body.is_empty() {
        match serde_json::from_slice(body) {
            Ok(Value::Object(fields)) => params.extend(fields),
            Ok(Value::Null) => {}
            Ok(_) => {
                return Err(GatewayError::BadRequest(
                    "request body must be a JSON object".to_string(),
                ))
            }
            Err(e) => {
                return Err(GatewayError::BadRequest(format!(
                    "request body is not valid JSON: {e}"
                )))
            }
        }
    }

    Ok(Value::Object(params))
}

fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn into_http_response(envelope: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, Json(envelope.data)).into_response();
    for (name, value) in &envelope.headers {
        if HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!("Dropping unrepresentable response header {}", name),
        }
    }
    response
}

/// Health check for the gateway itself
async fn health_check(State(state): State<GatewayState>) -> Json<Value> {
    let stats = state.client.get_stats().await;
    Json(json!({
        "status": if stats.connected { "healthy" } else { "unhealthy" },
        "gateway": "rabbitbridge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "client": stats,
    }))
}

/// Gateway-specific errors
#[derive(Debug)]
pub enum GatewayError {
    /// The inbound HTTP request cannot be turned into an RPC call
    BadRequest(String),
    /// The RPC call itself failed
    Rpc {
        service: String,
        source: RabbitBridgeError,
    },
}

impl GatewayError {
    /// HTTP status and machine-readable code for this failure
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            GatewayError::Rpc { source, .. } => match source {
                RabbitBridgeError::RequestTimeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "SERVICE_TIMEOUT")
                }
                RabbitBridgeError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
                RabbitBridgeError::InvalidResponse { .. } => {
                    (StatusCode::BAD_GATEWAY, "INVALID_SERVICE_RESPONSE")
                }
                err if err.is_connection_fault() => (StatusCode::BAD_GATEWAY, "SERVICE_UNAVAILABLE"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "GATEWAY_ERROR"),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let body = match self {
            GatewayError::BadRequest(reason) => json!({
                "error": reason,
                "code": code,
            }),
            GatewayError::Rpc { service, source } => {
                error!("RPC to {} failed: {}", service, source);
                json!({
                    "error": source.to_string(),
                    "service": service,
                    "code": code,
                })
            }
        };
        (status, Json(body)).into_response()
    }
}
