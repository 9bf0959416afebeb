//! Tokio codec for framed protocol messages
//!
//! The codec is stream-oriented: it never blocks or fails on partial
//! input, returning `Ok(None)` until a complete frame has arrived.
//! The transport feeds it whole WebSocket binary messages, but the
//! same codec works over any byte stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader, HEADER_SIZE, MAX_BODY_SIZE};
use crate::properties::Properties;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header decoded while awaiting its payload (if any)
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
        // Try to decode a header if we don't have one yet
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        let body_len = header.body_length as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        let props_len = header.properties_length as usize;
        if src.len() < props_len + body_len {
            // Save the header and wait for more data
            self.pending_header = Some(header);
            return Ok(None);
        }

        let props_bytes = src.split_to(props_len);
        let properties = Properties::decode(&props_bytes)?;
        let body = src.split_to(body_len).freeze();

        Ok(Some(Frame {
            frame_type: header.frame_type,
            session_id: header.session_id,
            properties,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = frame.body.len();
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        let props_len = frame.properties.encoded_len();
        if props_len > u16::MAX as usize {
            return Err(ProtocolError::PropertiesTooLarge(props_len));
        }

        let header = FrameHeader {
            frame_type: frame.frame_type,
            session_id: frame.session_id,
            properties_length: props_len as u16,
            body_length: body_len as u32,
        };
        header.encode(dst);

        frame.properties.encode(dst);
        dst.extend_from_slice(&frame.body);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use bytes::Bytes;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_codec_roundtrip_all_types() {
        let frames = [
            Frame::open_shell(SessionId::new(1), 24, 80),
            Frame::open_forward(SessionId::new(2), "device:80"),
            Frame::accept(SessionId::new(1)),
            Frame::reject(SessionId::new(2), "no such target"),
            Frame::data(SessionId::new(1), Bytes::from("ls\n")),
            Frame::resize(SessionId::new(1), 50, 132),
            Frame::close(SessionId::new(2)),
            Frame::error(SessionId::new(1), "shell exited"),
            Frame::ping(),
            Frame::pong(),
        ];

        for frame in frames {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_codec_empty_body() {
        let frame = roundtrip(Frame::close(SessionId::new(9)));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();
        let frame = Frame::data(SessionId::new(1), Bytes::from("hello, device"));

        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();

        // Header split mid-way: need more data, nothing consumed
        let mut partial = full.split_to(HEADER_SIZE - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete but body still missing
        partial.extend_from_slice(&full.split_to(4));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Rest arrives; decode succeeds with the retained header
        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_codec_two_frames_one_buffer() {
        let mut codec = FrameCodec::new();
        let first = Frame::data(SessionId::new(1), Bytes::from("a"));
        let second = Frame::data(SessionId::new(2), Bytes::from("b"));

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_oversize_body_rejected() {
        let mut codec = FrameCodec::new();
        let frame = Frame::data(
            SessionId::new(1),
            Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]),
        );

        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(ProtocolError::BodyTooLarge { .. })
        ));
    }
}
