//! Core error types for rh-exchange

use std::path::PathBuf;
use std::time::Duration;

use rhx_protocol::{ClientId, ProtocolError};
use thiserror::Error;

/// Errors raised while moving data through the tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Read, write or accept failure on a stream
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame could not be decoded or encoded
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// A frame named a client that is not in the local registry
    #[error("Unknown client identifier: {0}")]
    UnknownIdentifier(ClientId),

    /// Could not connect to a remote address
    #[error("Failed to dial {address}: {source}")]
    DialFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a remote address took too long
    #[error("Timed out dialing {address} after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    /// The control channel has been torn down
    #[error("Control channel closed")]
    ChannelClosed,
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TunnelError::Transport(e),
            other => TunnelError::Protocol(other),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
