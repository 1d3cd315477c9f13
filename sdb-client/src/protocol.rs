// Soft debugger wire protocol definitions and packet handling
//
// The framing is JDWP's: an 11-byte header followed by a length-implied payload.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// All multi-byte header and payload integers are big-endian (network byte order)

pub type SdbResult<T> = Result<T, SdbError>;

#[derive(Debug, Error)]
pub enum SdbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error code {code}: {name}")]
    ErrorCode { code: u16, name: &'static str },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("{feature} requires protocol {required}, negotiated {negotiated}")]
    Unsupported {
        feature: &'static str,
        required: ProtocolVersion,
        negotiated: ProtocolVersion,
    },

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

// Handshake literal, sent by the debugger and echoed by the agent
pub const HANDSHAKE: &[u8] = b"DWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Negotiated `(major, minor)` protocol version.
///
/// Ordering is lexicographic, so `>=` answers "is at least".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: i32,
    pub minor: i32,
}

impl ProtocolVersion {
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    pub fn is_at_least(&self, major: i32, minor: i32) -> bool {
        *self >= ProtocolVersion::new(major, minor)
    }

    /// Fail with `Unsupported` unless this version reaches `(major, minor)`.
    pub fn require(&self, major: i32, minor: i32, feature: &'static str) -> SdbResult<()> {
        if self.is_at_least(major, minor) {
            Ok(())
        } else {
            Err(SdbError::Unsupported {
                feature,
                required: ProtocolVersion::new(major, minor),
                negotiated: *self,
            })
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

/// A packet read off the transport: either a reply to one of our commands, or
/// a command sent by the agent (event notifications).
#[derive(Debug, Clone)]
pub enum IncomingPacket {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // command flag
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }
}

impl ReplyPacket {
    pub fn new(id: u32, error_code: u16, data: Vec<u8>) -> Self {
        Self {
            id,
            error_code,
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(REPLY_FLAG);
        buf.put_u16(self.error_code);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn check_error(&self) -> SdbResult<()> {
        if self.is_error() {
            Err(SdbError::ErrorCode {
                code: self.error_code,
                name: error_name(self.error_code),
            })
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl IncomingPacket {
    /// Decode a complete packet, header included.
    pub fn decode(mut buf: &[u8]) -> SdbResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SdbError::Protocol("Packet too short".to_string()));
        }

        let length = buf.get_u32() as usize;
        if length != buf.len() + 4 {
            return Err(SdbError::Protocol(format!(
                "Packet length mismatch: header says {}, got {}",
                length,
                buf.len() + 4
            )));
        }

        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags & REPLY_FLAG != 0 {
            let error_code = buf.get_u16();
            Ok(IncomingPacket::Reply(ReplyPacket {
                id,
                error_code,
                data: buf.to_vec(),
            }))
        } else if flags == 0 {
            let command_set = buf.get_u8();
            let command = buf.get_u8();
            Ok(IncomingPacket::Command(CommandPacket {
                id,
                command_set,
                command,
                data: buf.to_vec(),
            }))
        } else {
            Err(SdbError::Protocol(format!("Invalid packet flags: {:#x}", flags)))
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            IncomingPacket::Command(packet) => packet.id,
            IncomingPacket::Reply(packet) => packet.id,
        }
    }
}

// Answer of agents that predate a command
pub const NOT_IMPLEMENTED: u16 = 100;

/// Symbolic name of a remote error code
pub fn error_name(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        20 => "INVALID_OBJECT",
        25 => "INVALID_FIELDID",
        30 => "INVALID_FRAMEID",
        100 => "NOT_IMPLEMENTED",
        101 => "NOT_SUSPENDED",
        102 => "INVALID_ARGUMENT",
        103 => "ERR_UNLOADED",
        104 => "ERR_NO_INVOCATION",
        105 => "ABSENT_INFORMATION",
        106 => "NO_SEQ_POINT_AT_IL_OFFSET",
        107 => "INVOKE_ABORTED",
        108 => "LOOPING_INVOKE",
        _ => "UNKNOWN_ERROR",
    }
}
