//! Broker side of the control channel

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use rhx_core::relay;
use rhx_core::{control_channel, ControlLoopEnd, ControlSender, TunnelError};
use rhx_protocol::Message;

use crate::state::BrokerState;

/// Serve the agent's control channel until it ends.
///
/// Every client connection is closed afterwards; without the channel
/// there is nowhere to relay them.
pub(crate) async fn run_control(
    state: Arc<BrokerState>,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (mut reader, sender) = control_channel(socket, peer.to_string());

    let end = loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break ControlLoopEnd::Cancelled,
            _ = sender.closed() => break ControlLoopEnd::Closed,
            received = reader.recv() => received,
        };

        match received {
            Ok(Some(message)) => handle_message(&state, &sender, message).await,
            Ok(None) => break ControlLoopEnd::Closed,
            Err(e) => break ControlLoopEnd::Failed(e),
        }
    };

    match &end {
        ControlLoopEnd::Cancelled => tracing::debug!("Control loop for {} cancelled", peer),
        ControlLoopEnd::Closed => tracing::warn!("Agent {} closed the control channel", peer),
        ControlLoopEnd::Failed(e) => {
            tracing::error!("Control channel from {} failed: {}", peer, e)
        }
    }

    state.retire_control(&sender);
    sender.close().await;

    let closed = state.clients.clear().await;
    if closed > 0 {
        tracing::info!("Closed {} client connection(s) after losing the agent", closed);
    }
}

async fn handle_message(state: &BrokerState, sender: &ControlSender, message: Message) {
    match message {
        Message::AgentRegister { target } => {
            tracing::info!("Agent {} registered, target {}", sender.peer(), target);
            state.adopt_control(sender);
        }
        Message::AgentHeartbeat { timestamp } => {
            tracing::debug!("Heartbeat from agent {}: {}", sender.peer(), timestamp);
        }
        Message::ClientSendData { client, data } => {
            tracing::debug!("Received {} bytes for client {}", data.len(), client);
            match relay::deliver(&state.clients, &client, &data).await {
                Ok(()) => {}
                Err(TunnelError::UnknownIdentifier(client)) => {
                    tracing::warn!("No client connection for {}, dropping data", client);
                }
                Err(e) => {
                    tracing::warn!("Writing to client {} failed: {}", client, e);
                }
            }
        }
        other => {
            tracing::warn!(
                "Ignoring unexpected {:?} from agent {}",
                other.command(),
                sender.peer()
            );
        }
    }
}
