//! Frame types and header encoding/decoding
//!
//! The frame format uses an 11-byte header:
//! - frame_type: 1 byte (u8)
//! - session_id: 4 bytes (u32, big-endian)
//! - properties_length: 2 bytes (u16, big-endian)
//! - body_length: 4 bytes (u32, big-endian, capped at 16MB)
//!
//! followed by the properties block and the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::properties::Properties;
use crate::session::SessionId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum body size (16MB)
pub const MAX_BODY_SIZE: usize = 0x0100_0000;

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Request to open a new session
    Open = 0x01,
    /// Server accepted an Open
    Accept = 0x02,
    /// Server refused an Open
    Reject = 0x03,
    /// Session payload bytes
    Data = 0x04,
    /// Terminal resize event
    Resize = 0x05,
    /// Close a session (either side)
    Close = 0x06,
    /// Session-scoped error report
    Error = 0x07,
    /// Keepalive ping
    Ping = 0x08,
    /// Keepalive pong
    Pong = 0x09,
}

impl FrameType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Accept),
            0x03 => Some(Self::Reject),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Resize),
            0x06 => Some(Self::Close),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::Ping),
            0x09 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of this frame
    pub frame_type: FrameType,
    /// Session this frame belongs to
    pub session_id: SessionId,
    /// Length of the properties block in bytes
    pub properties_length: u16,
    /// Length of the body in bytes
    pub body_length: u32,
}

impl FrameHeader {
    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u32(self.session_id.as_u32());
        dst.put_u16(self.properties_length);
        dst.put_u32(self.body_length);
    }

    /// Decode a header from a byte buffer.
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the frame type byte is unknown.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the type byte first so an unknown type never consumes input
        let type_byte = src[0];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        src.advance(1);
        let session_id = SessionId::new(src.get_u32());
        let properties_length = src.get_u16();
        let body_length = src.get_u32();

        Ok(Some(Self {
            frame_type,
            session_id,
            properties_length,
            body_length,
        }))
    }
}

/// A complete protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type of this frame
    pub frame_type: FrameType,
    /// Session this frame belongs to
    pub session_id: SessionId,
    /// Typed properties block
    pub properties: Properties,
    /// Opaque payload, may be empty
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with explicit parts
    pub fn new(
        frame_type: FrameType,
        session_id: SessionId,
        properties: Properties,
        body: Bytes,
    ) -> Self {
        Self {
            frame_type,
            session_id,
            properties,
            body,
        }
    }

    /// Open request for a shell session with initial terminal size
    pub fn open_shell(session_id: SessionId, rows: u16, cols: u16) -> Self {
        Self::new(
            FrameType::Open,
            session_id,
            Properties::terminal(rows, cols),
            Bytes::new(),
        )
    }

    /// Open request for a forward session to `target_address`
    pub fn open_forward(session_id: SessionId, target_address: impl Into<String>) -> Self {
        Self::new(
            FrameType::Open,
            session_id,
            Properties::forward(target_address),
            Bytes::new(),
        )
    }

    /// Session payload
    pub fn data(session_id: SessionId, body: Bytes) -> Self {
        Self::new(FrameType::Data, session_id, Properties::empty(), body)
    }

    /// Terminal resize notification
    pub fn resize(session_id: SessionId, rows: u16, cols: u16) -> Self {
        Self::new(
            FrameType::Resize,
            session_id,
            Properties::terminal(rows, cols),
            Bytes::new(),
        )
    }

    /// Accept an Open (sent by the server side)
    pub fn accept(session_id: SessionId) -> Self {
        Self::new(
            FrameType::Accept,
            session_id,
            Properties::empty(),
            Bytes::new(),
        )
    }

    /// Refuse an Open, with a human-readable reason in the body
    pub fn reject(session_id: SessionId, reason: &str) -> Self {
        Self::new(
            FrameType::Reject,
            session_id,
            Properties::empty(),
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Close a session
    pub fn close(session_id: SessionId) -> Self {
        Self::new(
            FrameType::Close,
            session_id,
            Properties::empty(),
            Bytes::new(),
        )
    }

    /// Session-scoped error, with a human-readable message in the body
    pub fn error(session_id: SessionId, message: &str) -> Self {
        Self::new(
            FrameType::Error,
            session_id,
            Properties::empty(),
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    /// Keepalive ping (control session)
    pub fn ping() -> Self {
        Self::new(
            FrameType::Ping,
            SessionId::CONTROL,
            Properties::empty(),
            Bytes::new(),
        )
    }

    /// Keepalive pong (control session)
    pub fn pong() -> Self {
        Self::new(
            FrameType::Pong,
            SessionId::CONTROL,
            Properties::empty(),
            Bytes::new(),
        )
    }

    /// Reason text carried by Reject/Error frames
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
