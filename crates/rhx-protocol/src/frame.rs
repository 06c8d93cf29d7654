//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - command: 4 bytes (u32, big-endian)
//! - frame_length: 4 bytes (u32, big-endian), counting the header itself
//!
//! The payload follows immediately and is `frame_length - 8` bytes long.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16MB).
///
/// The length field could describe up to 4GB, but a corrupted header must
/// not make the reader allocate that much.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Frame header as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw command value (validated by the codec, not here)
    pub command: u32,
    /// Total frame length, header included
    pub frame_length: u32,
}

impl FrameHeader {
    /// Create a header for a payload of the given length
    pub fn for_payload(command: u32, payload_length: usize) -> Result<Self, ProtocolError> {
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            command,
            frame_length: (payload_length + HEADER_SIZE) as u32,
        })
    }

    /// Length of the payload that follows this header
    pub fn payload_length(&self) -> usize {
        self.frame_length as usize - HEADER_SIZE
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.command);
        dst.put_u32(self.frame_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the declared length is impossible.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate the length before consuming anything
        let frame_length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        if (frame_length as usize) < HEADER_SIZE {
            return Err(ProtocolError::InvalidLength(frame_length));
        }
        let payload_length = frame_length as usize - HEADER_SIZE;
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let command = src.get_u32();
        let _ = src.get_u32(); // frame_length already parsed

        Ok(Some(Self {
            command,
            frame_length,
        }))
    }
}
