//! Protocol error types

use thiserror::Error;

use crate::frame::HEADER_SIZE;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The stream ended before a complete frame was read
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Unknown command value
    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    /// Declared frame length is smaller than the header itself
    #[error("Invalid frame length: {0}")]
    InvalidLength(u32),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Client-data payload is shorter than its identifier prefix declares
    #[error("Malformed client data: identifier length {declared} exceeds {available} available bytes")]
    MalformedClientData { declared: usize, available: usize },

    /// Client identifier is not valid UTF-8
    #[error("Client identifier is not valid UTF-8")]
    InvalidIdentifier,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the stream is still positioned on a frame boundary.
    ///
    /// Only errors raised while interpreting an already fully consumed
    /// frame are recoverable; a reader hitting anything else must stop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_)
                | ProtocolError::MalformedClientData { .. }
                | ProtocolError::InvalidIdentifier
        )
    }

    /// Whether the stream ended before the first byte of a new frame.
    ///
    /// This is the `Truncated` case with zero header bytes read. Control
    /// loops treat it as the peer closing the channel.
    pub fn is_frame_boundary_eof(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated { expected, actual: 0 } if *expected == HEADER_SIZE
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ProtocolError::UnknownCommand(9).is_recoverable());
        assert!(ProtocolError::InvalidIdentifier.is_recoverable());
        assert!(ProtocolError::MalformedClientData {
            declared: 10,
            available: 2
        }
        .is_recoverable());

        assert!(!ProtocolError::Truncated {
            expected: 8,
            actual: 3
        }
        .is_recoverable());
        assert!(!ProtocolError::InvalidLength(4).is_recoverable());
        assert!(!ProtocolError::Io(std::io::ErrorKind::BrokenPipe.into()).is_recoverable());
    }

    #[test]
    fn test_frame_boundary_eof() {
        assert!(ProtocolError::Truncated {
            expected: 8,
            actual: 0
        }
        .is_frame_boundary_eof());

        assert!(!ProtocolError::Truncated {
            expected: 8,
            actual: 5
        }
        .is_frame_boundary_eof());
        assert!(!ProtocolError::Truncated {
            expected: 20,
            actual: 8
        }
        .is_frame_boundary_eof());
        assert!(!ProtocolError::InvalidLength(0).is_frame_boundary_eof());
    }
}
