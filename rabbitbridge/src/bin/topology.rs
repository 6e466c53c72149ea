//! Declares the shared exchanges, request queues, event queues and the
//! dead-letter queue on the broker named by `RABBITMQ_*`.

use anyhow::{Context, Result};
use clap::Parser;
use rabbitbridge::{setup_topology, AmqpTransport, ConnectionConfig, TopologySpec, Transport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rabbitbridge-topology", about = "Declare the RabbitMQ topology shared by the shop services")]
struct Cli {
    /// Delete every queue and exchange before declaring them again
    #[arg(long, env = "TOPOLOGY_FORCE")]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rabbitbridge=info,rabbitbridge_topology=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ConnectionConfig::from_env().context("loading RABBITMQ_* settings")?;
    tracing::info!("Setting up topology on {}", config.endpoint());

    let transport = AmqpTransport::new(config);
    let spec = TopologySpec::ecommerce();
    let outcome = setup_topology(&transport, &spec, cli.force).await;
    transport.disconnect().await?;
    outcome?;

    tracing::info!("Declared {} queues", spec.queue_names().len());
    Ok(())
}
