//! Broker listener
//!
//! Accepts every incoming connection and hands it to a control or client
//! task depending on whether it claimed the control slot.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use rhx_core::config::BrokerConfig;

use super::{client, control};
use crate::state::BrokerState;

/// Server that listens for the agent and for external clients
pub struct BrokerServer {
    listener: TcpListener,
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl BrokerServer {
    /// Bind the listen address.
    ///
    /// This is the only broker failure that is fatal to the process.
    pub async fn bind(config: BrokerConfig, cancel: CancellationToken) -> Result<Self> {
        let bind_addr = config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            state: Arc::new(BrokerState::new(config)),
            cancel,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared broker state
    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        let local_addr = self.listener.local_addr()?;
        tracing::info!("Broker listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Broker shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.state.shutdown().await;
        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let state = Arc::clone(&self.state);
        if state.claim_control(&peer_addr.to_string()) {
            tracing::info!("Taking connection from {} as the control channel", peer_addr);
            let cancel = self.cancel.clone();
            tokio::spawn(control::run_control(state, socket, peer_addr, cancel));
        } else {
            tracing::info!("New client connection from {}", peer_addr);
            tokio::spawn(client::run_client(state, socket, peer_addr));
        }
    }
}
