//! Codec for encoding and decoding Parley frames.
//!
//! The wire format is newline-delimited JSON: one frame per line. The
//! streaming decoder consumes the offending line even when it fails to
//! parse, so a malformed frame never wedges the stream.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, FRAME_TYPES};

/// Maximum encoded frame size, delimiter included (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Syntactically valid JSON whose `type` tag is not a known frame.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Malformed JSON or a known type with missing/invalid fields.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a frame to a JSON line (trailing `\n` included).
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_string(frame: &Frame) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');

    if line.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(line.len()));
    }

    Ok(line)
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    encode_string(frame).map(Bytes::from)
}

/// Decode a single frame from a line (with or without the delimiter).
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownType`] naming the tag when the line
/// is valid JSON but carries an unrecognized `type`, and
/// [`ProtocolError::Malformed`] for everything else.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let line = trim_line(data);

    match serde_json::from_slice::<Frame>(line) {
        Ok(frame) => Ok(frame),
        Err(err) => {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) {
                if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
                    if !FRAME_TYPES.contains(&tag) {
                        return Err(ProtocolError::UnknownType(tag.to_string()));
                    }
                }
            }
            Err(ProtocolError::Malformed(err))
        }
    }
}

/// Try to decode a frame from a buffer, advancing past the line even on
/// parse failure.
///
/// Returns `Ok(Some(frame))` if a complete line was decoded,
/// `Ok(None)` if no full line is buffered yet, or `Err` on protocol
/// error. A [`ProtocolError::FrameTooLarge`] means the peer is sending
/// an unbounded line; callers should drop the connection.
///
/// # Errors
///
/// Returns an error if the buffered line is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    loop {
        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(buf.len()));
            }
            return Ok(None);
        };

        if newline + 1 > MAX_FRAME_SIZE {
            buf.advance(newline + 1);
            return Err(ProtocolError::FrameTooLarge(newline + 1));
        }

        let line = buf.split_to(newline + 1);
        if trim_line(&line).is_empty() {
            // Blank keep-alive lines are tolerated.
            continue;
        }
        return decode(&line).map(Some);
    }
}

fn trim_line(data: &[u8]) -> &[u8] {
    let mut line = data;
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::MessageRecord;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::auth("token123"),
            Frame::auth_success("alice"),
            Frame::join("room-1"),
            Frame::join_success("room-1", "general"),
            Frame::leave("room-1"),
            Frame::leave_success("room-1"),
            Frame::message("room-1", "Hello, world!"),
            Frame::NewMessage(MessageRecord {
                id: "abc".into(),
                room_id: "room-1".into(),
                sender: "alice".into(),
                content: "hi".into(),
                timestamp: 42,
            }),
            Frame::message_history("room-1", vec![]),
            Frame::error("Room not found: nope"),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            assert_eq!(encoded.last(), Some(&b'\n'));
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_unknown_type_is_named() {
        let err = decode(br#"{"type":"SHRUG","roomId":"r"}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(tag) => assert_eq!(tag, "SHRUG"),
            other => panic!("Expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_known_type_bad_fields_is_malformed() {
        let err = decode(br#"{"type":"JOIN"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_streaming_decode() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&Frame::auth("t1")).unwrap());
        buf.extend_from_slice(&encode(&Frame::join("room-1")).unwrap());

        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::auth("t1")));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::join("room-1")));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode_partial_line() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"type":"AUTH","#);
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\"token\":\"t1\"}\n");
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::auth("t1")));
    }

    #[test]
    fn test_streaming_decode_skips_bad_line() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"not json\n");
        buf.extend_from_slice(&encode(&Frame::leave("room-1")).unwrap());

        assert!(decode_from(&mut buf).is_err());
        // The bad line was consumed; the next frame decodes cleanly.
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::leave("room-1")));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::message("room-1", "x".repeat(MAX_FRAME_SIZE));
        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_FRAME_SIZE + 1]);
        match decode_from(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n\r\n");
        buf.extend_from_slice(&encode(&Frame::auth("t1")).unwrap());

        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::auth("t1")));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_crlf_tolerated() {
        let frame = decode(b"{\"type\":\"AUTH\",\"token\":\"t1\"}\r\n").unwrap();
        assert_eq!(frame, Frame::auth("t1"));
    }
}
