//! Typed frame properties
//!
//! The properties block carries the small, enumerated key set the
//! server understands: terminal dimensions for shell sessions and the
//! target address for port forwards. Each entry is encoded as
//! `key: u8` + `len: u16 BE` + value bytes; entries appear in fixed
//! key order so encoding is deterministic.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Property key byte values on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PropertyKey {
    Rows = 0x01,
    Cols = 0x02,
    TargetAddress = 0x03,
}

/// Typed property set attached to a frame.
///
/// All fields are optional; which ones are present depends on the
/// frame type (Open for a shell carries rows/cols, Open for a forward
/// carries the target address, Resize carries fresh rows/cols).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    rows: Option<u16>,
    cols: Option<u16>,
    target_address: Option<String>,
}

impl Properties {
    /// Empty property set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Properties for a shell session: terminal dimensions
    pub fn terminal(rows: u16, cols: u16) -> Self {
        Self {
            rows: Some(rows),
            cols: Some(cols),
            target_address: None,
        }
    }

    /// Properties for a forward session: the device-side target
    pub fn forward(target_address: impl Into<String>) -> Self {
        Self {
            rows: None,
            cols: None,
            target_address: Some(target_address.into()),
        }
    }

    /// Terminal rows, if present
    pub fn rows(&self) -> Option<u16> {
        self.rows
    }

    /// Terminal columns, if present
    pub fn cols(&self) -> Option<u16> {
        self.cols
    }

    /// Forward target `host:port`, if present
    pub fn target_address(&self) -> Option<&str> {
        self.target_address.as_deref()
    }

    /// True if no property is set
    pub fn is_empty(&self) -> bool {
        self.rows.is_none() && self.cols.is_none() && self.target_address.is_none()
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.rows.is_some() {
            len += 3 + 2;
        }
        if self.cols.is_some() {
            len += 3 + 2;
        }
        if let Some(target) = &self.target_address {
            len += 3 + target.len();
        }
        len
    }

    /// Encode the property entries into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        if let Some(rows) = self.rows {
            dst.put_u8(PropertyKey::Rows as u8);
            dst.put_u16(2);
            dst.put_u16(rows);
        }
        if let Some(cols) = self.cols {
            dst.put_u8(PropertyKey::Cols as u8);
            dst.put_u16(2);
            dst.put_u16(cols);
        }
        if let Some(target) = &self.target_address {
            dst.put_u8(PropertyKey::TargetAddress as u8);
            dst.put_u16(target.len() as u16);
            dst.put_slice(target.as_bytes());
        }
    }

    /// Decode a properties block of exactly `src.len()` bytes.
    ///
    /// Entries with unknown keys are skipped so newer servers can add
    /// properties without breaking older clients. A block that ends
    /// mid-entry is malformed.
    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        let mut props = Properties::default();

        while src.has_remaining() {
            if src.remaining() < 3 {
                return Err(ProtocolError::MalformedProperties);
            }
            let key = src.get_u8();
            let len = src.get_u16() as usize;
            if src.remaining() < len {
                return Err(ProtocolError::MalformedProperties);
            }

            match key {
                k if k == PropertyKey::Rows as u8 => {
                    if len != 2 {
                        return Err(ProtocolError::MalformedProperties);
                    }
                    props.rows = Some(src.get_u16());
                }
                k if k == PropertyKey::Cols as u8 => {
                    if len != 2 {
                        return Err(ProtocolError::MalformedProperties);
                    }
                    props.cols = Some(src.get_u16());
                }
                k if k == PropertyKey::TargetAddress as u8 => {
                    let value = std::str::from_utf8(&src[..len])
                        .map_err(|_| ProtocolError::MalformedProperties)?
                        .to_string();
                    props.target_address = Some(value);
                    src.advance(len);
                }
                other => {
                    tracing::debug!(key = other, len, "Skipping unknown property");
                    src.advance(len);
                }
            }
        }

        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(props: Properties) -> Properties {
        let mut buf = BytesMut::new();
        props.encode(&mut buf);
        Properties::decode(&buf).unwrap()
    }

    #[test]
    fn test_terminal_roundtrip() {
        let props = Properties::terminal(24, 80);
        assert_eq!(roundtrip(props.clone()), props);
    }

    #[test]
    fn test_forward_roundtrip() {
        let props = Properties::forward("device:8080");
        assert_eq!(roundtrip(props.clone()), props);
    }

    #[test]
    fn test_empty_roundtrip() {
        let props = Properties::empty();
        assert_eq!(props.encoded_len(), 0);
        assert_eq!(roundtrip(props.clone()), props);
    }

    #[test]
    fn test_unknown_key_skipped() {
        let mut buf = BytesMut::new();
        // Unknown key 0x7F with a 1-byte value, then a valid rows entry
        buf.put_u8(0x7F);
        buf.put_u16(1);
        buf.put_u8(0xAA);
        Properties::terminal(50, 132).encode(&mut buf);

        let props = Properties::decode(&buf).unwrap();
        assert_eq!(props.rows(), Some(50));
        assert_eq!(props.cols(), Some(132));
    }

    #[test]
    fn test_truncated_entry_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(PropertyKey::TargetAddress as u8);
        buf.put_u16(10);
        buf.put_slice(b"shor"); // 4 bytes, 10 declared

        assert!(matches!(
            Properties::decode(&buf),
            Err(ProtocolError::MalformedProperties)
        ));
    }

    #[test]
    fn test_invalid_utf8_target_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(PropertyKey::TargetAddress as u8);
        buf.put_u16(2);
        buf.put_slice(&[0xFF, 0xFE]);

        assert!(matches!(
            Properties::decode(&buf),
            Err(ProtocolError::MalformedProperties)
        ));
    }
}
