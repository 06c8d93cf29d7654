//! rhx-protocol: Wire protocol for rh-exchange tunnel multiplexing
//!
//! This crate defines the binary protocol spoken between the broker and
//! its agent over the single control channel: the length-delimited frame
//! format, the command set, and the nested client-data payload that lets
//! one channel carry many client connections.

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use client::ClientId;
pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{build_client_data, parse_client_data, Command, Message};
