//! Codec for encoding and decoding STOMP frames.
//!
//! The wire format is line oriented text followed by a NUL terminated body:
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...
//! \n
//! body^@
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{header, Command, Frame, Headers};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame terminator.
const NUL: u8 = 0;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// Command line is not a known STOMP command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Header line without a colon separator.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Undefined escape sequence in a header.
    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    /// `content-length` is not a valid length.
    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),

    /// Command or header bytes are not UTF-8.
    #[error("Frame header is not valid UTF-8")]
    InvalidUtf8,

    /// Body declared by `content-length` is not followed by NUL.
    #[error("Frame is not NUL terminated")]
    MissingTerminator,
}

/// Encode a frame to bytes.
///
/// A `content-length` header is added when the body is non-empty and the
/// frame does not already carry one.
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(encoded_len_hint(frame));
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`].
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = buf.len();
    let raw = frame.command.is_raw();

    buf.reserve(encoded_len_hint(frame));
    buf.put_slice(frame.command.as_str().as_bytes());
    buf.put_u8(b'\n');

    for (name, value) in frame.headers.iter() {
        put_escaped(buf, name, raw);
        buf.put_u8(b':');
        put_escaped(buf, value, raw);
        buf.put_u8(b'\n');
    }

    if !frame.body.is_empty() && !frame.headers.contains(header::CONTENT_LENGTH) {
        buf.put_slice(header::CONTENT_LENGTH.as_bytes());
        buf.put_u8(b':');
        buf.put_slice(frame.body.len().to_string().as_bytes());
        buf.put_u8(b'\n');
    }

    buf.put_u8(b'\n');
    buf.put_slice(&frame.body);
    buf.put_u8(NUL);

    let size = buf.len() - start;
    if size > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(size));
    }

    Ok(())
}

/// Decode a single frame from bytes.
///
/// Leading heart-beat line endings are skipped. Trailing bytes after the
/// frame terminator are ignored.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    match parse(data)? {
        Some((frame, _)) => Ok(frame),
        None => Err(ProtocolError::Incomplete),
    }
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    match parse(&buf[..])? {
        Some((frame, consumed)) => {
            buf.advance(consumed);
            Ok(Some(frame))
        }
        None => {
            // Drop heart-beats so an idle peer does not grow the buffer.
            let eols = leading_eols(&buf[..]);
            buf.advance(eols);
            Ok(None)
        }
    }
}

/// Parse one frame, returning it with the number of bytes consumed.
fn parse(data: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let start = leading_eols(data);
    let input = &data[start..];

    let Some(head_len) = find_header_end(input) else {
        if input.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(input.len()));
        }
        return Ok(None);
    };

    let head =
        std::str::from_utf8(&input[..head_len.text]).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut lines = head
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));

    let command_line = lines.next().unwrap_or_default();
    let command: Command = command_line
        .parse()
        .map_err(ProtocolError::UnknownCommand)?;
    let raw = command.is_raw();

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        if raw {
            headers.add(name, value);
        } else {
            headers.add(unescape(name)?, unescape(value)?);
        }
    }

    let body_start = head_len.total;
    let rest = &input[body_start..];

    let body_len = match headers.get(header::CONTENT_LENGTH) {
        Some(value) => {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
            if len > MAX_FRAME_SIZE.saturating_sub(body_start) {
                return Err(ProtocolError::FrameTooLarge(body_start.saturating_add(len)));
            }
            if rest.len() <= len {
                return Ok(None);
            }
            if rest[len] != NUL {
                return Err(ProtocolError::MissingTerminator);
            }
            len
        }
        None => match rest.iter().position(|&b| b == NUL) {
            Some(pos) => pos,
            None => {
                if body_start + rest.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge(body_start + rest.len()));
                }
                return Ok(None);
            }
        },
    };

    let frame = Frame {
        command,
        headers,
        body: Bytes::copy_from_slice(&rest[..body_len]),
    };

    Ok(Some((frame, start + body_start + body_len + 1)))
}

/// Offsets of the header block: `text` excludes the terminating blank line,
/// `total` includes it.
struct HeadLen {
    text: usize,
    total: usize,
}

fn find_header_end(input: &[u8]) -> Option<HeadLen> {
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\n' {
            let line_start = i + 1;
            if input.get(line_start) == Some(&b'\n') {
                return Some(HeadLen {
                    text: i,
                    total: line_start + 1,
                });
            }
            if input.get(line_start) == Some(&b'\r')
                && input.get(line_start + 1) == Some(&b'\n')
            {
                return Some(HeadLen {
                    text: i,
                    total: line_start + 2,
                });
            }
        }
        i += 1;
    }
    None
}

fn leading_eols(data: &[u8]) -> usize {
    let mut i = 0;
    loop {
        match data.get(i..) {
            Some([b'\n', ..]) => i += 1,
            Some([b'\r', b'\n', ..]) => i += 2,
            _ => return i,
        }
    }
}

fn put_escaped(buf: &mut BytesMut, value: &str, raw: bool) {
    if raw {
        buf.put_slice(value.as_bytes());
        return;
    }
    for byte in value.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            b':' => buf.put_slice(b"\\c"),
            other => buf.put_u8(other),
        }
    }
}

fn unescape(value: &str) -> Result<String, ProtocolError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(ProtocolError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

fn encoded_len_hint(frame: &Frame) -> usize {
    let headers: usize = frame
        .headers
        .iter()
        .map(|(name, value)| name.len() + value.len() + 2)
        .sum();
    frame.command.as_str().len() + headers + frame.body.len() + 32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::send("/topic/a", "hello").with_header("x-tag", "1");
        let encoded = encode(&frame).unwrap();
        assert_eq!(
            &encoded[..],
            b"SEND\ndestination:/topic/a\nx-tag:1\ncontent-length:5\n\nhello\0"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::connect("1.1,1.2", "localhost"),
            Frame::subscribe("sub-1", "/topic/a"),
            Frame::send("/queue/b", b"\x00binary\x00".to_vec()),
            Frame::message("/topic/a", "hi").with_header("subscription", "sub-1"),
            Frame::receipt("77"),
            Frame::error("bad frame", "details here"),
            Frame::disconnect(),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded.command, frame.command);
            assert_eq!(decoded.body, frame.body);
            for (name, value) in frame.headers.iter() {
                assert_eq!(decoded.header(name), Some(value));
            }
        }
    }

    #[test]
    fn test_header_escaping() {
        let frame = Frame::send("/a", "").with_header("note", "a:b\nc\\d");
        let encoded = encode(&frame).unwrap();
        assert!(encoded
            .windows(b"note:a\\cb\\nc\\\\d".len())
            .any(|w| w == b"note:a\\cb\\nc\\\\d"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_connect_frames_are_not_escaped() {
        let decoded = decode(b"CONNECT\nlogin:a\\cb\n\n\0").unwrap();
        assert_eq!(decoded.header("login"), Some("a\\cb"));
    }

    #[test]
    fn test_invalid_escape() {
        match decode(b"SEND\ndestination:/a\\t\n\n\0") {
            Err(ProtocolError::InvalidEscape(_)) => {}
            other => panic!("Expected InvalidEscape error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_without_content_length() {
        let decoded = decode(b"SEND\r\ndestination:/a\r\n\r\nhello\0").unwrap();
        assert_eq!(decoded.destination(), Some("/a"));
        assert_eq!(&decoded.body[..], b"hello");
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::send("/a", "hello");
        let encoded = encode(&frame).unwrap();

        match decode(&encoded[..encoded.len() - 1]) {
            Err(ProtocolError::Incomplete) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode(b"PUBLISH\n\n\0"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            decode(b"SEND\nno-colon\n\n\0"),
            Err(ProtocolError::MalformedHeader(_))
        ));
        assert!(matches!(
            decode(b"SEND\ncontent-length:x\n\n\0"),
            Err(ProtocolError::InvalidContentLength(_))
        ));
        assert!(matches!(
            decode(b"SEND\ncontent-length:1\n\nab\0"),
            Err(ProtocolError::MissingTerminator)
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::send("/a", vec![b'x'; MAX_FRAME_SIZE]);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_content_length_is_rejected() {
        let data = b"SEND\ndestination:/a\ncontent-length:18446744073709551615\n\n\0";
        assert!(matches!(decode(data), Err(ProtocolError::FrameTooLarge(_))));

        // Rejected from the header alone, before the body arrives.
        let mut buf = BytesMut::from(&b"SEND\ndestination:/a\ncontent-length:16777216\n\nxx"[..]);
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::subscribe("1", "/topic/a");
        let frame2 = Frame::send("/topic/a", "payload");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n\r\n");
        encode_into(&frame1, &mut buf).unwrap();
        buf.extend_from_slice(b"\n");
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(decoded1.header("id"), Some("1"));
        assert_eq!(&decoded2.body[..], b"payload");
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_streaming_partial_then_complete() {
        let encoded = encode(&Frame::send("/a", "abc")).unwrap();
        let mut buf = BytesMut::from(&encoded[..6]);

        assert!(decode_from(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[6..]);
        assert!(decode_from(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_heart_beats_are_discarded() {
        let mut buf = BytesMut::from(&b"\n\n\r\n"[..]);
        assert!(decode_from(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
