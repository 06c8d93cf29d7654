//! Commands and typed messages for the rh-exchange protocol
//!
//! A [`Frame`] carries a bare command plus an opaque payload. This module
//! gives those payloads meaning.
//!
//! # Message Flow
//!
//! 1. Agent dials the broker and sends `AgentRegister` (no reply is sent)
//! 2. Agent sends `AgentHeartbeat` whenever the channel has been idle
//! 3. A client connects to the broker: broker sends `ServerConnect`
//! 4. Client bytes travel as `ServerSendData`, target bytes as `ClientSendData`
//! 5. The client goes away: broker sends `ServerDisconnect`
//!
//! # Client Data Payload
//!
//! The two data commands carry a nested payload so a single frame can name
//! its client and still hold arbitrary binary data:
//!
//! ```text
//! id_length: u32 (big-endian) | id: id_length bytes | data: remaining bytes
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::ClientId;
use crate::codec::Frame;
use crate::error::ProtocolError;

/// Size of the identifier length prefix in client-data payloads
const ID_LENGTH_SIZE: usize = 4;

/// Command identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Agent announces itself and the address it forwards to
    AgentRegister = 0,
    /// Agent liveness signal
    AgentHeartbeat = 1,
    /// A new external client connected to the broker
    ServerConnect = 2,
    /// Bytes from an external client, for the target
    ServerSendData = 3,
    /// Bytes from the target, for an external client
    ClientSendData = 4,
    /// An external client went away
    ServerDisconnect = 5,
}

impl Command {
    /// Convert to u32
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::AgentRegister),
            1 => Some(Self::AgentHeartbeat),
            2 => Some(Self::ServerConnect),
            3 => Some(Self::ServerSendData),
            4 => Some(Self::ClientSendData),
            5 => Some(Self::ServerDisconnect),
            _ => None,
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value).ok_or(ProtocolError::UnknownCommand(value))
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Agent registration
    AgentRegister {
        /// Address the agent forwards tunneled connections to
        target: String,
    },

    /// Heartbeat
    AgentHeartbeat {
        /// Opaque timestamp, only logged by the broker
        timestamp: String,
    },

    /// New external client
    ServerConnect { client: ClientId },

    /// Client → target bytes
    ServerSendData { client: ClientId, data: Bytes },

    /// Target → client bytes
    ClientSendData { client: ClientId, data: Bytes },

    /// External client closed
    ServerDisconnect { client: ClientId },
}

impl Message {
    /// Get the command for this message
    pub fn command(&self) -> Command {
        match self {
            Message::AgentRegister { .. } => Command::AgentRegister,
            Message::AgentHeartbeat { .. } => Command::AgentHeartbeat,
            Message::ServerConnect { .. } => Command::ServerConnect,
            Message::ServerSendData { .. } => Command::ServerSendData,
            Message::ClientSendData { .. } => Command::ClientSendData,
            Message::ServerDisconnect { .. } => Command::ServerDisconnect,
        }
    }

    /// Build the data message a relay emits for the given direction.
    ///
    /// # Panics
    ///
    /// In debug builds, if `command` is not `ServerSendData` or
    /// `ClientSendData`.
    pub fn data(command: Command, client: ClientId, data: Bytes) -> Self {
        debug_assert!(
            matches!(command, Command::ServerSendData | Command::ClientSendData),
            "{:?} does not carry client data",
            command
        );
        match command {
            Command::ServerSendData => Message::ServerSendData { client, data },
            _ => Message::ClientSendData { client, data },
        }
    }

    /// Interpret a decoded frame
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame { command, payload } = frame;

        let message = match command {
            Command::AgentRegister => Message::AgentRegister {
                target: String::from_utf8_lossy(&payload).into_owned(),
            },
            Command::AgentHeartbeat => Message::AgentHeartbeat {
                timestamp: String::from_utf8_lossy(&payload).into_owned(),
            },
            Command::ServerConnect => Message::ServerConnect {
                client: parse_identifier(&payload)?,
            },
            Command::ServerDisconnect => Message::ServerDisconnect {
                client: parse_identifier(&payload)?,
            },
            Command::ServerSendData => {
                let (client, data) = parse_client_data(payload)?;
                Message::ServerSendData { client, data }
            }
            Command::ClientSendData => {
                let (client, data) = parse_client_data(payload)?;
                Message::ClientSendData { client, data }
            }
        };

        Ok(message)
    }

    /// Convert into a frame ready for encoding
    pub fn into_frame(self) -> Frame {
        let command = self.command();
        let payload = match self {
            Message::AgentRegister { target } => Bytes::from(target),
            Message::AgentHeartbeat { timestamp } => Bytes::from(timestamp),
            Message::ServerConnect { client } | Message::ServerDisconnect { client } => {
                Bytes::copy_from_slice(client.as_str().as_bytes())
            }
            Message::ServerSendData { client, data } | Message::ClientSendData { client, data } => {
                build_client_data(&client, &data)
            }
        };

        Frame::new(command, payload)
    }
}

/// Build a client-data payload: `id_length | id | data`
pub fn build_client_data(client: &ClientId, data: &[u8]) -> Bytes {
    let id = client.as_str().as_bytes();

    let mut buf = BytesMut::with_capacity(ID_LENGTH_SIZE + id.len() + data.len());
    buf.put_u32(id.len() as u32);
    buf.put_slice(id);
    buf.put_slice(data);
    buf.freeze()
}

/// Split a client-data payload into its identifier and data.
///
/// The returned data shares the payload's allocation.
pub fn parse_client_data(payload: Bytes) -> Result<(ClientId, Bytes), ProtocolError> {
    if payload.len() < ID_LENGTH_SIZE {
        return Err(ProtocolError::MalformedClientData {
            declared: ID_LENGTH_SIZE,
            available: payload.len(),
        });
    }

    let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let available = payload.len() - ID_LENGTH_SIZE;
    if declared > available {
        return Err(ProtocolError::MalformedClientData {
            declared,
            available,
        });
    }

    let id_end = ID_LENGTH_SIZE + declared;
    let client = parse_identifier(&payload[ID_LENGTH_SIZE..id_end])?;
    Ok((client, payload.slice(id_end..)))
}

fn parse_identifier(raw: &[u8]) -> Result<ClientId, ProtocolError> {
    std::str::from_utf8(raw)
        .map(ClientId::from)
        .map_err(|_| ProtocolError::InvalidIdentifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        for command in [
            Command::AgentRegister,
            Command::AgentHeartbeat,
            Command::ServerConnect,
            Command::ServerSendData,
            Command::ClientSendData,
            Command::ServerDisconnect,
        ] {
            let value = command.as_u32();
            let recovered = Command::from_u32(value).unwrap();
            assert_eq!(recovered, command);
        }
    }

    #[test]
    fn test_command_wire_values() {
        assert_eq!(Command::AgentRegister.as_u32(), 0);
        assert_eq!(Command::AgentHeartbeat.as_u32(), 1);
        assert_eq!(Command::ServerConnect.as_u32(), 2);
        assert_eq!(Command::ServerSendData.as_u32(), 3);
        assert_eq!(Command::ClientSendData.as_u32(), 4);
        assert_eq!(Command::ServerDisconnect.as_u32(), 5);
        assert!(matches!(
            Command::try_from(6),
            Err(ProtocolError::UnknownCommand(6))
        ));
    }

    #[test]
    fn test_client_data_roundtrip() {
        let client = ClientId::from("203.0.113.7:51000");
        let payload = build_client_data(&client, b"PING");

        assert_eq!(&payload[..4], &[0, 0, 0, 17]);

        let (parsed, data) = parse_client_data(payload).unwrap();
        assert_eq!(parsed, client);
        assert_eq!(&data[..], b"PING");
    }

    #[test]
    fn test_client_data_non_ascii_and_empty() {
        let client = ClientId::from("клиент-🦀:9000");
        let payload = build_client_data(&client, b"");

        let (parsed, data) = parse_client_data(payload).unwrap();
        assert_eq!(parsed, client);
        assert!(data.is_empty());
    }

    #[test]
    fn test_client_data_binary_payload() {
        let client = ClientId::from("[::1]:4000");
        let all_bytes: Vec<u8> = (0..=255u8).collect();

        let (parsed, data) = parse_client_data(build_client_data(&client, &all_bytes)).unwrap();
        assert_eq!(parsed, client);
        assert_eq!(&data[..], &all_bytes[..]);
    }

    #[test]
    fn test_client_data_malformed() {
        let result = parse_client_data(Bytes::from_static(&[0, 0]));
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedClientData { .. })
        ));

        let result = parse_client_data(Bytes::from_static(&[0, 0, 0, 9, b'a', b'b']));
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedClientData {
                declared: 9,
                available: 2
            })
        ));
    }

    #[test]
    fn test_client_data_invalid_utf8_identifier() {
        let result = parse_client_data(Bytes::from_static(&[0, 0, 0, 2, 0xC3, 0x28, 1]));
        assert!(matches!(result, Err(ProtocolError::InvalidIdentifier)));
    }

    #[test]
    fn test_message_frame_roundtrip() {
        let messages = vec![
            Message::AgentRegister {
                target: "127.0.0.1:9000".to_string(),
            },
            Message::AgentHeartbeat {
                timestamp: "1700000000000".to_string(),
            },
            Message::ServerConnect {
                client: ClientId::from("10.1.1.1:3000"),
            },
            Message::ServerSendData {
                client: ClientId::from("10.1.1.1:3000"),
                data: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
            },
            Message::ClientSendData {
                client: ClientId::from("10.1.1.1:3000"),
                data: Bytes::from_static(b"\x00\x01\x02"),
            },
            Message::ServerDisconnect {
                client: ClientId::from("10.1.1.1:3000"),
            },
        ];

        for message in messages {
            let frame = message.clone().into_frame();
            assert_eq!(frame.command, message.command());
            assert_eq!(Message::from_frame(frame).unwrap(), message);
        }
    }

    #[test]
    fn test_server_connect_payload_is_bare_identifier() {
        let frame = Message::ServerConnect {
            client: ClientId::from("1.2.3.4:5"),
        }
        .into_frame();
        assert_eq!(&frame.payload[..], b"1.2.3.4:5");
    }

    #[test]
    fn test_data_constructor_direction() {
        let client = ClientId::from("a:1");
        let data = Bytes::from_static(b"x");

        assert_eq!(
            Message::data(Command::ServerSendData, client.clone(), data.clone()).command(),
            Command::ServerSendData
        );
        assert_eq!(
            Message::data(Command::ClientSendData, client, data).command(),
            Command::ClientSendData
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not carry client data")]
    fn test_data_constructor_rejects_control_command() {
        Message::data(
            Command::ServerConnect,
            ClientId::from("a:1"),
            Bytes::from_static(b"x"),
        );
    }
}
