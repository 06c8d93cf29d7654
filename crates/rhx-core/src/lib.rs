//! rhx-core: Shared tunnel machinery for rh-exchange
//!
//! This crate provides the pieces the broker and the agent have in common:
//! the per-client connection registry, the control channel halves, the
//! relay engine that moves bytes between raw streams and frames, the
//! transport seam, and configuration.

pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod time;
pub mod transport;

pub use channel::{control_channel, ActivityFlag, ControlLoopEnd, ControlReader, ControlSender};
pub use error::{ConfigError, TunnelError};
pub use registry::{ConnectionRegistry, StreamHandle};
pub use transport::{BoxedReader, BoxedStream, BoxedWriter, Dialer, DuplexStream, TcpDialer};
