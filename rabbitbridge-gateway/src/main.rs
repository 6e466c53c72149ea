use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue};
use rabbitbridge::{ConnectionConfig, RpcClient};
use rabbitbridge_gateway::{create_router, GatewayState, Settings};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rabbitbridge_gateway=info,rabbitbridge=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RabbitBridge gateway...");

    let settings = Settings::new().context("loading GATEWAY_* settings")?;
    let broker = ConnectionConfig::from_env().context("loading RABBITMQ_* settings")?;
    tracing::info!("Configuration loaded");

    let timeout = settings.gateway.request_timeout()?;

    let client = Arc::new(RpcClient::connect(settings.gateway.name.clone(), broker).await?);

    let app = create_router(GatewayState::new(client.clone(), timeout)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&settings.gateway.cors_origins)),
    );

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_address).await?;
    tracing::info!("Gateway listening on {}", settings.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    client.close().await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_TYPE])
}
