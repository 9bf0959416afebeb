//! dl-protocol: Wire protocol for devlink tunnel session multiplexing
//!
//! This crate defines the binary framing used on the device tunnel:
//! every message is a self-delimiting frame carrying a type, a session
//! identifier, a typed properties block, and an opaque body.

pub mod codec;
pub mod error;
pub mod frame;
pub mod properties;
pub mod session;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameHeader, FrameType, HEADER_SIZE, MAX_BODY_SIZE};
pub use properties::Properties;
pub use session::SessionId;
