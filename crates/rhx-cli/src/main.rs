//! rh-exchange - reverse tunnel exchange
//!
//! One binary for both ends of the tunnel. Started with a broker address
//! and a target address it runs as the agent next to the hidden service;
//! otherwise it runs as the public broker.

mod args;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rhx_agent::Agent;
use rhx_broker::BrokerServer;
use rhx_core::config::Role;

use crate::args::{load_config_file, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level().into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let file = load_config_file(cli.config.as_deref())?;
    let settings = cli.resolve(file)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match settings.role {
        Role::Broker { listen } => {
            tracing::info!("rh-exchange broker starting on {}", listen);
            let server = BrokerServer::bind(settings.broker, cancel).await?;
            server.run().await?;
            tracing::info!("Broker shutdown complete");
        }
        Role::Agent { broker, target } => {
            tracing::info!("rh-exchange agent starting: broker {}, target {}", broker, target);
            Agent::new(settings.agent).run(cancel).await?;
            tracing::info!("Agent shutdown complete");
        }
    }

    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
