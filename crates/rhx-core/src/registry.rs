//! Connection registry
//!
//! Maps a [`ClientId`] to the writable side of its live stream. The broker
//! keeps one for external clients, the agent one for dialed targets. The
//! read side of each stream belongs to the relay task that pumps it; the
//! registry entry owns the write side plus a close signal that the relay
//! task watches.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use rhx_protocol::ClientId;

use crate::transport::BoxedWriter;

/// Handle to one registered stream
pub struct StreamHandle {
    /// Client this stream serves
    client: ClientId,
    /// Write half of the stream
    writer: Mutex<BoxedWriter>,
    /// Fired when the stream is closed
    closed: CancellationToken,
}

impl StreamHandle {
    /// Wrap the write half of a stream
    pub fn new(client: ClientId, writer: BoxedWriter) -> Arc<Self> {
        Arc::new(Self {
            client,
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }

    /// Client this stream serves
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Write all of `data` to the stream.
    ///
    /// A write blocked on a slow peer is abandoned as soon as the handle is
    /// closed.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
            _ = self.closed.cancelled() => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Close the stream. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of stream for {} failed: {}", self.client, e);
        }
    }

    /// Whether the stream has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the stream is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("client", &self.client)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Concurrency-safe map of live client streams
#[derive(Default)]
pub struct ConnectionRegistry {
    /// Streams indexed by client ID
    entries: DashMap<ClientId, Arc<StreamHandle>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a stream under its client ID.
    ///
    /// At most one stream lives per ID: a stream already registered under
    /// the same ID is closed and replaced.
    pub async fn insert(&self, handle: Arc<StreamHandle>) {
        let client = handle.client().clone();
        if let Some(previous) = self.entries.insert(client, handle) {
            tracing::warn!(
                "Replacing live stream for client {}, closing the old one",
                previous.client()
            );
            previous.close().await;
        }
    }

    /// Get the stream registered for a client
    pub fn lookup(&self, client: &ClientId) -> Option<Arc<StreamHandle>> {
        self.entries.get(client).map(|r| Arc::clone(&r))
    }

    /// Whether a client is registered
    pub fn contains(&self, client: &ClientId) -> bool {
        self.entries.contains_key(client)
    }

    /// Remove and close the stream for a client.
    ///
    /// Removing an absent client is a no-op. Returns whether an entry was
    /// removed.
    pub async fn remove(&self, client: &ClientId) -> bool {
        match self.entries.remove(client) {
            Some((_, handle)) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Remove and close `handle`, but only if it is still the stream
    /// registered for its client.
    ///
    /// Relay tasks use this on exit so a newer stream that reused the same
    /// ID is left alone. The handle itself is closed either way.
    pub async fn remove_if_current(&self, handle: &Arc<StreamHandle>) -> bool {
        let removed = self
            .entries
            .remove_if(handle.client(), |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        handle.close().await;
        removed
    }

    /// Remove and close every stream. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let clients: Vec<ClientId> = self.entries.iter().map(|r| r.key().clone()).collect();

        let mut removed = 0;
        for client in clients {
            if self.remove(&client).await {
                removed += 1;
            }
        }
        removed
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
