//! Control channel halves
//!
//! The control channel has exactly one reader, its owning control loop,
//! and any number of writers: every relay task sends frames on it. The
//! sender serializes writers with a mutex held for one whole frame so a
//! header and its payload are never interleaved with another frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use rhx_protocol::{FrameCodec, Message, ProtocolError};

use crate::error::TunnelError;
use crate::transport::{BoxedReader, BoxedWriter, DuplexStream};

/// Split a control stream into its reading and writing halves
pub fn control_channel<S>(stream: S, peer: impl Into<String>) -> (ControlReader, ControlSender)
where
    S: DuplexStream,
{
    let peer = peer.into();
    let (read_half, write_half) = tokio::io::split(stream);
    (
        ControlReader::new(Box::new(read_half), peer.clone()),
        ControlSender::new(Box::new(write_half), peer),
    )
}

/// Records whether any frame went over the channel since it was last
/// checked.
#[derive(Debug, Default, Clone)]
pub struct ActivityFlag(Arc<AtomicBool>);

impl ActivityFlag {
    /// Create a cleared flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a frame was exchanged
    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Reading half of the control channel
pub struct ControlReader {
    frames: FramedRead<BoxedReader, FrameCodec>,
    peer: String,
}

impl ControlReader {
    fn new(reader: BoxedReader, peer: String) -> Self {
        Self {
            frames: FramedRead::new(reader, FrameCodec::new()),
            peer,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame
    /// boundary, which the codec reports as a zero-byte `Truncated`.
    /// Frames that decode but cannot be interpreted are logged and
    /// skipped. Any error returned is terminal: the stream position can no
    /// longer be trusted.
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            let frame = match self.frames.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) if e.is_frame_boundary_eof() => {
                    tracing::debug!("Control stream from {} ended", self.peer);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            };

            let command = frame.command;
            match Message::from_frame(frame) {
                Ok(message) => return Ok(Some(message)),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(
                        "Dropping malformed {:?} frame from {}: {}",
                        command,
                        self.peer,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Why a control loop stopped
#[derive(Debug)]
pub enum ControlLoopEnd {
    /// Shutdown was requested
    Cancelled,
    /// The peer closed the control channel, or a write to it failed
    Closed,
    /// The control stream could no longer be decoded
    Failed(ProtocolError),
}

impl std::fmt::Display for ControlLoopEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlLoopEnd::Cancelled => write!(f, "shutdown requested"),
            ControlLoopEnd::Closed => write!(f, "control channel closed"),
            ControlLoopEnd::Failed(e) => write!(f, "control channel failed: {}", e),
        }
    }
}

/// Shared writing half of the control channel
#[derive(Clone)]
pub struct ControlSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    sink: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    closed: CancellationToken,
    activity: Option<ActivityFlag>,
    peer: String,
}

impl ControlSender {
    fn new(writer: BoxedWriter, peer: String) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                sink: Mutex::new(FramedWrite::new(writer, FrameCodec::new())),
                closed: CancellationToken::new(),
                activity: None,
                peer,
            }),
        }
    }

    /// Mark `activity` on every frame sent except heartbeats.
    ///
    /// Must be called before the sender is cloned.
    pub fn with_activity(self, activity: ActivityFlag) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.activity = Some(activity);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("Activity tracking requested on a shared sender, ignoring");
                Self { inner }
            }
        }
    }

    /// Remote end of this channel
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Send one message as a single uninterrupted frame write.
    ///
    /// A transport failure closes the sender: the frame may have been
    /// partially written and the stream is no longer usable.
    pub async fn send(&self, message: Message) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed);
        }

        let is_heartbeat = matches!(message, Message::AgentHeartbeat { .. });

        let mut sink = self.inner.sink.lock().await;
        let result = tokio::select! {
            result = sink.send(message) => result,
            _ = self.inner.closed.cancelled() => return Err(TunnelError::ChannelClosed),
        };
        drop(sink);

        match result {
            Ok(()) => {
                if !is_heartbeat {
                    if let Some(activity) = &self.inner.activity {
                        activity.mark();
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Control channel write to {} failed: {}", self.inner.peer, e);
                self.inner.closed.cancel();
                Err(e.into())
            }
        }
    }

    /// Close the channel for writing. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = SinkExt::<Message>::close(&mut *sink).await {
            tracing::debug!("Closing control channel to {} failed: {}", self.inner.peer, e);
        }
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Whether two senders write to the same channel
    pub fn same_channel(&self, other: &ControlSender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSender")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rhx_protocol::ClientId;

    #[tokio::test]
    async fn test_send_and_recv() {
        let (a, b) = tokio::io::duplex(4096);
        let (_a_reader, a_sender) = control_channel(a, "agent");
        let (mut b_reader, _b_sender) = control_channel(b, "broker");

        let message = Message::AgentRegister {
            target: "127.0.0.1:9000".to_string(),
        };
        a_sender.send(message.clone()).await.unwrap();

        assert_eq!(b_reader.recv().await.unwrap(), Some(message));
    }

    #[tokio::test]
    async fn test_recv_none_on_clean_close() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut reader, _sender) = control_channel(b, "peer");
        drop(a);

        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_none_after_last_frame() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(4096);
        let (mut reader, _sender) = control_channel(b, "peer");

        let message = Message::ServerDisconnect {
            client: ClientId::from("x:1"),
        };
        raw.write_all(&message.clone().into_frame().to_bytes().unwrap())
            .await
            .unwrap();
        drop(raw);

        assert_eq!(reader.recv().await.unwrap(), Some(message));
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_fails_on_partial_header() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(4096);
        let (mut reader, _sender) = control_channel(b, "peer");

        raw.write_all(&[0, 0, 0, 1, 0]).await.unwrap();
        drop(raw);

        assert!(matches!(
            reader.recv().await,
            Err(ProtocolError::Truncated {
                expected: 8,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_recv_skips_malformed_frame() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(4096);
        let (mut reader, _sender) = control_channel(b, "peer");

        // ClientSendData whose identifier length overruns the payload
        raw.write_all(&[0, 0, 0, 4, 0, 0, 0, 14, 0, 0, 0, 99, 1, 2])
            .await
            .unwrap();
        let good = Message::AgentHeartbeat {
            timestamp: "1".to_string(),
        };
        raw.write_all(&good.clone().into_frame().to_bytes().unwrap())
            .await
            .unwrap();

        assert_eq!(reader.recv().await.unwrap(), Some(good));
    }

    #[tokio::test]
    async fn test_closed_sender_rejects_sends() {
        let (a, _b) = tokio::io::duplex(4096);
        let (_reader, sender) = control_channel(a, "peer");

        sender.close().await;
        sender.close().await;

        let result = sender
            .send(Message::ServerConnect {
                client: ClientId::from("x:1"),
            })
            .await;
        assert!(matches!(result, Err(TunnelError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_activity_skips_heartbeats() {
        let (a, _b) = tokio::io::duplex(4096);
        let activity = ActivityFlag::new();
        let (_reader, sender) = control_channel(a, "peer");
        let sender = sender.with_activity(activity.clone());

        sender
            .send(Message::AgentHeartbeat {
                timestamp: "1".to_string(),
            })
            .await
            .unwrap();
        assert!(!activity.take());

        sender
            .send(Message::ClientSendData {
                client: ClientId::from("x:1"),
                data: Bytes::from_static(b"data"),
            })
            .await
            .unwrap();
        assert!(activity.take());
        assert!(!activity.take());
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_frames_whole() {
        let (a, b) = tokio::io::duplex(256);
        let (_a_reader, sender) = control_channel(a, "writer");
        let (mut reader, _b_sender) = control_channel(b, "reader");

        const WRITERS: usize = 8;
        const FRAMES: usize = 50;

        let mut tasks = Vec::new();
        for w in 0..WRITERS {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                let client = ClientId::from(format!("10.0.0.{}:1000", w));
                for i in 0..FRAMES {
                    let data = Bytes::from(vec![w as u8; 100 + i]);
                    sender
                        .send(Message::ClientSendData {
                            client: client.clone(),
                            data,
                        })
                        .await
                        .unwrap();
                }
            }));
        }

        let mut next_len = vec![100usize; WRITERS];
        for _ in 0..WRITERS * FRAMES {
            match reader.recv().await.unwrap().unwrap() {
                Message::ClientSendData { client, data } => {
                    let w: usize = client.as_str()[7..client.as_str().find(':').unwrap()]
                        .parse()
                        .unwrap();
                    assert!(data.iter().all(|&b| b == w as u8));
                    // Per-writer order is preserved
                    assert_eq!(data.len(), next_len[w]);
                    next_len[w] += 1;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}
