//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type byte
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Properties block does not match its declared length
    #[error("Malformed properties block")]
    MalformedProperties,

    /// Body exceeds maximum size
    #[error("Body too large: {size} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    /// Properties block exceeds the 16-bit length field
    #[error("Properties block too large: {0} bytes")]
    PropertiesTooLarge(usize),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
