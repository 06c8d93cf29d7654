//! External client connections

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use rhx_core::relay::{self, PumpExit};
use rhx_core::TunnelError;
use rhx_protocol::{ClientId, Command, Message};

use crate::state::BrokerState;

/// Relay one external client over the control channel.
///
/// The client is identified by its remote address. It waits for the agent
/// to register, announces itself with `ServerConnect`, streams its bytes as
/// `ServerSendData`, and ends with `ServerDisconnect`.
pub(crate) async fn run_client(state: Arc<BrokerState>, socket: TcpStream, peer: SocketAddr) {
    let client = ClientId::from(peer);

    let Some(control) = state.wait_for_control().await else {
        tracing::warn!("No agent control channel, dropping client {}", client);
        return;
    };

    let (read_half, write_half) = socket.into_split();
    let handle = relay::register(&state.clients, client.clone(), write_half).await;

    if let Err(e) = control
        .send(Message::ServerConnect {
            client: client.clone(),
        })
        .await
    {
        tracing::error!("Failed to announce client {} to the agent: {}", client, e);
        state.clients.remove_if_current(&handle).await;
        return;
    }
    tracing::debug!("Announced client {} to agent {}", client, control.peer());

    let exit = relay::pump(&handle, read_half, Command::ServerSendData, &control).await;
    match &exit {
        PumpExit::Eof => tracing::info!("Client {} disconnected", client),
        _ => tracing::info!("Client {} closed: {}", client, exit),
    }

    state.clients.remove_if_current(&handle).await;

    if control.is_closed() {
        return;
    }
    match control.send(Message::ServerDisconnect { client: client.clone() }).await {
        Ok(()) => {}
        Err(TunnelError::ChannelClosed) => {}
        Err(e) => {
            tracing::warn!("Failed to send disconnect for client {}: {}", client, e);
        }
    }
}
