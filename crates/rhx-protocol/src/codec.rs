//! Tokio codec for framed protocol messages

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::message::{Command, Message};

/// A complete frame: command plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command carried by this frame
    pub command: Command,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Encode this frame into `dst`, computing the length field from the
    /// actual payload.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let header = FrameHeader::for_payload(self.command.as_u32(), self.payload.len())?;
        dst.reserve(HEADER_SIZE + self.payload.len());
        header.encode(dst);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode this frame into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Codec for encoding/decoding protocol frames
///
/// Frames with an unknown command are consumed and skipped with a warning:
/// the length field still tells us where the next frame starts.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Try to decode header if we don't have one
            let header = match self.pending_header.take() {
                Some(h) => h,
                None => match FrameHeader::decode(src)? {
                    Some(h) => h,
                    None => return Ok(None), // Need more data
                },
            };

            // Check if we have enough data for the payload
            let payload_len = header.payload_length();
            if src.len() < payload_len {
                src.reserve(payload_len - src.len());
                self.pending_header = Some(header);
                return Ok(None);
            }

            let payload = src.split_to(payload_len).freeze();

            match Command::from_u32(header.command) {
                Some(command) => return Ok(Some(Frame { command, payload })),
                None => {
                    tracing::warn!(
                        "Skipping frame with unknown command {} ({} payload bytes)",
                        header.command,
                        payload_len
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // Counts cover the whole frame, so a stream ending on a frame
        // boundary reports `expected: 8, actual: 0`
        let (expected, actual) = match self.pending_header.take() {
            Some(header) => (
                HEADER_SIZE + header.payload_length(),
                HEADER_SIZE + src.len(),
            ),
            None => (HEADER_SIZE, src.len()),
        };
        src.clear();

        Err(ProtocolError::Truncated { expected, actual })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode_into(dst)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        message.into_frame().encode_into(dst)
    }
}
