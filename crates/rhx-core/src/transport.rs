//! Transport abstraction
//!
//! The tunnel only needs a reliable, ordered, bidirectional byte stream.
//! TCP is the default; anything implementing [`DuplexStream`] works.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::TunnelError;

/// A reliable, ordered, bidirectional byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex stream
pub type BoxedStream = Box<dyn DuplexStream>;

/// Type-erased read half
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens outbound streams
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address`
    async fn dial(&self, address: &str) -> Result<BoxedStream, TunnelError>;
}

/// Dials plain TCP connections with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer that gives up after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, TunnelError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TunnelError::DialTimeout {
                address: address.to_string(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| TunnelError::DialFailure {
                address: address.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = TcpDialer::default().dial(&address).await.unwrap();
        stream.write_all(b"hi").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpDialer::default().dial(&address).await;
        assert!(matches!(result, Err(TunnelError::DialFailure { .. })));
    }
}
