//! Relay engine
//!
//! Both directions of a tunneled connection go through here:
//! [`pump`] turns raw bytes read from a client or target stream into data
//! frames on the control channel, and [`deliver`] writes the data of an
//! inbound frame to the stream registered for its client.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use rhx_protocol::{ClientId, Command, Message};

use crate::channel::ControlSender;
use crate::error::TunnelError;
use crate::registry::{ConnectionRegistry, StreamHandle};

/// Read buffer size for relayed streams
pub const READ_BUFFER_SIZE: usize = 4096;

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpExit {
    /// The stream reached end of file
    Eof,
    /// The registry entry was closed
    Closed,
    /// Reading from the stream failed
    ReadFailed(io::Error),
    /// The control channel could not take the frame
    ChannelFailed(TunnelError),
}

impl std::fmt::Display for PumpExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpExit::Eof => write!(f, "end of stream"),
            PumpExit::Closed => write!(f, "closed locally"),
            PumpExit::ReadFailed(e) => write!(f, "read failed: {}", e),
            PumpExit::ChannelFailed(e) => write!(f, "control channel failed: {}", e),
        }
    }
}

/// Copy bytes from `reader` into `command` frames for `handle`'s client
/// until the stream ends, errors, or the handle is closed.
///
/// `command` is the data command for this direction: `ServerSendData` on
/// the broker, `ClientSendData` on the agent.
pub async fn pump<R>(
    handle: &StreamHandle,
    mut reader: R,
    command: Command,
    control: &ControlSender,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    let client = handle.client();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);

        let read = tokio::select! {
            _ = handle.closed() => return PumpExit::Closed,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => return PumpExit::Eof,
            Ok(n) => {
                tracing::trace!("Relaying {} bytes for client {} as {:?}", n, client, command);
                let data = buf.split().freeze();
                if let Err(e) = control
                    .send(Message::data(command, client.clone(), data))
                    .await
                {
                    return PumpExit::ChannelFailed(e);
                }
            }
            Err(e) => return PumpExit::ReadFailed(e),
        }
    }
}

/// Write inbound data to the stream registered for `client`.
///
/// A failed write drops the entry so the relay task for that stream winds
/// down.
pub async fn deliver(
    registry: &ConnectionRegistry,
    client: &ClientId,
    data: &[u8],
) -> Result<(), TunnelError> {
    let handle = registry
        .lookup(client)
        .ok_or_else(|| TunnelError::UnknownIdentifier(client.clone()))?;

    if let Err(e) = handle.write(data).await {
        registry.remove_if_current(&handle).await;
        return Err(TunnelError::Transport(e));
    }

    Ok(())
}

/// Register a freshly split stream and return its handle.
///
/// Convenience for the accept/dial paths on both sides.
pub async fn register<W>(
    registry: &ConnectionRegistry,
    client: ClientId,
    writer: W,
) -> Arc<StreamHandle>
where
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let handle = StreamHandle::new(client, Box::new(writer));
    registry.insert(Arc::clone(&handle)).await;
    handle
}
