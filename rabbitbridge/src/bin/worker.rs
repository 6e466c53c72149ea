//! Serves `{service}.requests` by forwarding every request to the service's
//! own HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rabbitbridge::{
    AmqpTransport, ConnectionConfig, HttpForwarder, RpcServer, ServerConfig, Transport,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rabbitbridge-worker", about = "RPC worker in front of a service's HTTP API")]
struct Cli {
    /// Service whose request queue is consumed
    #[arg(long, env = "WORKER_SERVICE")]
    service: String,

    /// Base URL of the local HTTP API; requests go to `{local_url}/api/{path}`
    #[arg(long, env = "WORKER_LOCAL_URL", default_value = "http://localhost:3000")]
    local_url: String,

    /// Competing consumers, each handling one request at a time
    #[arg(long, env = "WORKER_CONSUMERS", default_value_t = 1)]
    consumers: usize,

    /// Timeout of each local HTTP call, in seconds
    #[arg(long, env = "WORKER_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,

    /// Pause before listening again after the broker connection is lost, in seconds
    #[arg(long, env = "WORKER_RECONNECT_DELAY_SECS", default_value_t = 5)]
    reconnect_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rabbitbridge=info,rabbitbridge_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ConnectionConfig::from_env().context("loading RABBITMQ_* settings")?;
    let transport: Arc<dyn Transport> = Arc::new(AmqpTransport::new(config));
    let forwarder = HttpForwarder::new(&cli.local_url, Duration::from_secs(cli.http_timeout_secs))?;

    let server = Arc::new(RpcServer::new(
        cli.service.clone(),
        transport.clone(),
        Arc::new(forwarder),
        ServerConfig {
            consumer_count: cli.consumers,
        },
    ));
    info!("Worker for {} forwarding to {}", cli.service, cli.local_url);

    let shutdown = tokio::spawn({
        let server = server.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                server.stop_listening();
            }
        }
    });

    loop {
        match server.start_listening().await {
            Ok(()) => break,
            Err(e) if shutdown.is_finished() => {
                warn!("Worker for {} stopped with: {}", cli.service, e);
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(
                    "Worker for {} lost the broker: {}; retrying in {}s",
                    cli.service, e, cli.reconnect_delay_secs
                );
                tokio::time::sleep(Duration::from_secs(cli.reconnect_delay_secs)).await;
                if shutdown.is_finished() {
                    break;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    transport.disconnect().await?;
    info!("Worker for {} shut down", cli.service);
    Ok(())
}
