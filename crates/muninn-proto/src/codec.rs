//! Streaming RESP encoder/decoder.
//!
//! The decoder accepts partial input: [`Decoder::decode`] returns `Ok(None)`
//! until a complete top-level frame is buffered, and leaves any unconsumed
//! tail in place for the next call. Decode failures are fatal for the
//! connection that produced them; the connection layer tears down and
//! resynchronizes by reconnecting.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Frame, ServerError};

/// Maximum aggregate nesting the decoder will follow before giving up on a
/// frame as malformed.
pub const MAX_NESTING_DEPTH: usize = 64;

const CRLF: &[u8] = b"\r\n";

/// A fatal wire-level decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unknown frame prefix byte.
    InvalidPrefix(u8),
    /// A length header was not a valid decimal integer.
    InvalidLength,
    /// An integer frame did not fit in a signed 64-bit value.
    IntegerOverflow,
    /// A double frame was not a valid IEEE-754 token.
    InvalidDouble,
    /// A boolean frame was neither `#t` nor `#f`.
    InvalidBoolean,
    /// A big number frame contained non-digit characters.
    InvalidBigNumber,
    /// A verbatim string was missing its format tag.
    InvalidVerbatim,
    /// A null frame carried a payload.
    InvalidNull,
    /// A bulk payload was not terminated by CRLF.
    MissingTerminator,
    /// Aggregates nested deeper than [`MAX_NESTING_DEPTH`].
    DepthExceeded,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidPrefix(b) => write!(f, "invalid frame prefix byte 0x{b:02x}"),
            DecodeError::InvalidLength => write!(f, "invalid length header"),
            DecodeError::IntegerOverflow => write!(f, "integer frame overflows i64"),
            DecodeError::InvalidDouble => write!(f, "invalid double frame"),
            DecodeError::InvalidBoolean => write!(f, "invalid boolean frame"),
            DecodeError::InvalidBigNumber => write!(f, "invalid big number frame"),
            DecodeError::InvalidVerbatim => write!(f, "verbatim string missing format tag"),
            DecodeError::InvalidNull => write!(f, "null frame with payload"),
            DecodeError::MissingTerminator => write!(f, "bulk payload missing CRLF terminator"),
            DecodeError::DepthExceeded => {
                write!(f, "aggregate nesting exceeds {MAX_NESTING_DEPTH}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a command as a RESP array of bulk strings.
///
/// Both protocol versions accept this request shape. Arguments are already
/// bytes; nothing is escaped or inspected.
pub fn encode_command(dst: &mut BytesMut, parts: &[Bytes]) {
    dst.reserve(16 + parts.iter().map(|p| p.len() + 16).sum::<usize>());
    dst.put_u8(b'*');
    put_decimal(dst, parts.len() as i64);
    dst.put_slice(CRLF);
    for part in parts {
        dst.put_u8(b'$');
        put_decimal(dst, part.len() as i64);
        dst.put_slice(CRLF);
        dst.put_slice(part);
        dst.put_slice(CRLF);
    }
}

/// Encode an arbitrary frame.
///
/// The client only ever sends command arrays; this exists for the server
/// side of test harnesses and is exercised heavily by the integration
/// suites.
pub fn encode_frame(dst: &mut BytesMut, frame: &Frame) {
    match frame {
        Frame::Simple(data) => put_line(dst, b'+', data),
        Frame::Error(err) => put_line(dst, b'-', &err.message),
        Frame::Integer(value) => {
            dst.put_u8(b':');
            put_decimal(dst, *value);
            dst.put_slice(CRLF);
        }
        Frame::Bulk(data) => put_blob(dst, b'$', data),
        Frame::Array(items) => put_aggregate(dst, b'*', items),
        Frame::Set(items) => put_aggregate(dst, b'~', items),
        Frame::Push(items) => put_aggregate(dst, b'>', items),
        Frame::Map(pairs) => put_pairs(dst, b'%', pairs),
        Frame::Boolean(value) => {
            dst.put_slice(if *value { b"#t\r\n" } else { b"#f\r\n" });
        }
        Frame::Double(value) => {
            dst.put_u8(b',');
            if value.is_nan() {
                dst.put_slice(b"nan");
            } else if value.is_infinite() {
                dst.put_slice(if *value > 0.0 { b"inf" } else { b"-inf" });
            } else {
                dst.put_slice(value.to_string().as_bytes());
            }
            dst.put_slice(CRLF);
        }
        Frame::BigNumber(data) => put_line(dst, b'(', data),
        Frame::Null => dst.put_slice(b"_\r\n"),
        Frame::Verbatim { format, data } => {
            dst.put_u8(b'=');
            put_decimal(dst, (data.len() + 4) as i64);
            dst.put_slice(CRLF);
            dst.put_slice(format);
            dst.put_u8(b':');
            dst.put_slice(data);
            dst.put_slice(CRLF);
        }
        Frame::Attribute { attrs, inner } => {
            put_pairs(dst, b'|', attrs);
            encode_frame(dst, inner);
        }
    }
}

fn put_decimal(dst: &mut BytesMut, value: i64) {
    let mut buf = [0u8; 20];
    dst.put_slice(write_decimal(&mut buf, value));
}

fn put_line(dst: &mut BytesMut, prefix: u8, data: &[u8]) {
    dst.put_u8(prefix);
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

fn put_blob(dst: &mut BytesMut, prefix: u8, data: &[u8]) {
    dst.put_u8(prefix);
    put_decimal(dst, data.len() as i64);
    dst.put_slice(CRLF);
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

fn put_aggregate(dst: &mut BytesMut, prefix: u8, items: &[Frame]) {
    dst.put_u8(prefix);
    put_decimal(dst, items.len() as i64);
    dst.put_slice(CRLF);
    for item in items {
        encode_frame(dst, item);
    }
}

fn put_pairs(dst: &mut BytesMut, prefix: u8, pairs: &[(Frame, Frame)]) {
    dst.put_u8(prefix);
    put_decimal(dst, pairs.len() as i64);
    dst.put_slice(CRLF);
    for (key, value) in pairs {
        encode_frame(dst, key);
        encode_frame(dst, value);
    }
}

fn write_decimal(buf: &mut [u8; 20], value: i64) -> &[u8] {
    // i64::MIN fits: sign + 19 digits.
    let mut n = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if value < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

/// Incremental RESP decoder with a carry buffer.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// The carry buffer, for use with `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append raw bytes to the carry buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode one complete top-level frame.
    ///
    /// `Ok(None)` means more bytes are needed; the buffered prefix is kept.
    pub fn decode(&mut self) -> Result<Option<Frame>, DecodeError> {
        match parse_frame(&self.buf, 0, 0)? {
            None => Ok(None),
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
        }
    }
}

/// Find the CRLF-terminated line starting at `pos`, returning the line body
/// and the position just past the terminator.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let mut i = pos;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some((&buf[pos..i], i + 2));
        }
        i += 1;
    }
    None
}

fn parse_i64(line: &[u8]) -> Result<i64, DecodeError> {
    if line.is_empty() {
        return Err(DecodeError::IntegerOverflow);
    }
    let (negative, digits) = match line[0] {
        b'-' => (true, &line[1..]),
        b'+' => (false, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(DecodeError::IntegerOverflow);
    }
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(DecodeError::IntegerOverflow);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| {
                let d = (b - b'0') as i64;
                if negative { v.checked_sub(d) } else { v.checked_add(d) }
            })
            .ok_or(DecodeError::IntegerOverflow)?;
    }
    Ok(value)
}

/// Length headers reject overflow with a distinct error from integer frames.
fn parse_len(line: &[u8]) -> Result<i64, DecodeError> {
    parse_i64(line).map_err(|_| DecodeError::InvalidLength)
}

fn parse_double(line: &[u8]) -> Result<f64, DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidDouble)?;
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        other => other.parse::<f64>().map_err(|_| DecodeError::InvalidDouble),
    }
}

type Parsed = Option<(Frame, usize)>;

fn parse_frame(buf: &[u8], pos: usize, depth: usize) -> Result<Parsed, DecodeError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DecodeError::DepthExceeded);
    }
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, mut next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    let frame = match prefix {
        b'+' => Frame::Simple(Bytes::copy_from_slice(line)),
        b'-' => Frame::Error(ServerError::parse(Bytes::copy_from_slice(line))),
        b':' => Frame::Integer(parse_i64(line)?),
        b'#' => match line {
            b"t" => Frame::Boolean(true),
            b"f" => Frame::Boolean(false),
            _ => return Err(DecodeError::InvalidBoolean),
        },
        b',' => Frame::Double(parse_double(line)?),
        b'(' => {
            let digits = match line.first() {
                Some(b'+') | Some(b'-') => &line[1..],
                _ => line,
            };
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return Err(DecodeError::InvalidBigNumber);
            }
            Frame::BigNumber(Bytes::copy_from_slice(line))
        }
        b'_' => {
            if !line.is_empty() {
                return Err(DecodeError::InvalidNull);
            }
            Frame::Null
        }
        b'$' | b'!' | b'=' => {
            let len = parse_len(line)?;
            if len == -1 {
                // RESP2 nil bulk string.
                Frame::Null
            } else {
                let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
                if buf.len() < next + len + 2 {
                    return Ok(None);
                }
                let payload = &buf[next..next + len];
                if &buf[next + len..next + len + 2] != CRLF {
                    return Err(DecodeError::MissingTerminator);
                }
                next += len + 2;
                match prefix {
                    b'$' => Frame::Bulk(Bytes::copy_from_slice(payload)),
                    b'!' => Frame::Error(ServerError::parse(Bytes::copy_from_slice(payload))),
                    _ => {
                        // Verbatim: `xxx:` format tag then the body.
                        if len < 4 || payload[3] != b':' {
                            return Err(DecodeError::InvalidVerbatim);
                        }
                        Frame::Verbatim {
                            format: [payload[0], payload[1], payload[2]],
                            data: Bytes::copy_from_slice(&payload[4..]),
                        }
                    }
                }
            }
        }
        b'*' | b'~' | b'>' => {
            let len = parse_len(line)?;
            if len == -1 && prefix == b'*' {
                // RESP2 nil array.
                Frame::Null
            } else {
                let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    match parse_frame(buf, next, depth + 1)? {
                        None => return Ok(None),
                        Some((item, after)) => {
                            items.push(item);
                            next = after;
                        }
                    }
                }
                match prefix {
                    b'*' => Frame::Array(items),
                    b'~' => Frame::Set(items),
                    _ => Frame::Push(items),
                }
            }
        }
        b'%' | b'|' => {
            let len = parse_len(line)?;
            let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
            let mut pairs = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                let Some((key, after)) = parse_frame(buf, next, depth + 1)? else {
                    return Ok(None);
                };
                let Some((value, after)) = parse_frame(buf, after, depth + 1)? else {
                    return Ok(None);
                };
                pairs.push((key, value));
                next = after;
            }
            if prefix == b'%' {
                Frame::Map(pairs)
            } else {
                // Attributes decorate the frame that follows them.
                let Some((inner, after)) = parse_frame(buf, next, depth + 1)? else {
                    return Ok(None);
                };
                next = after;
                Frame::Attribute {
                    attrs: pairs,
                    inner: Box::new(inner),
                }
            }
        }
        other => return Err(DecodeError::InvalidPrefix(other)),
    };

    Ok(Some((frame, next)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut decoder = Decoder::new();
        decoder.extend(input);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode().unwrap() {
            out.push(frame);
        }
        assert_eq!(decoder.buffered(), 0, "trailing bytes left in buffer");
        out
    }

    fn decode_one(input: &[u8]) -> Frame {
        let mut frames = decode_all(input);
        assert_eq!(frames.len(), 1);
        frames.pop().unwrap()
    }

    #[test]
    fn command_encoding_is_array_of_bulk_strings() {
        let mut dst = BytesMut::new();
        encode_command(
            &mut dst,
            &[Bytes::from_static(b"GET"), Bytes::from_static(b"k")],
        );
        assert_eq!(&dst[..], b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }

    #[test]
    fn command_encoding_is_binary_safe() {
        let mut dst = BytesMut::new();
        encode_command(
            &mut dst,
            &[
                Bytes::from_static(b"SET"),
                Bytes::from_static(b"k"),
                Bytes::from_static(b"a\r\nb\x00c"),
            ],
        );
        assert_eq!(&dst[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$7\r\na\r\nb\x00c\r\n");
    }

    #[test]
    fn scalar_kinds() {
        assert_eq!(decode_one(b"+OK\r\n"), Frame::simple("OK"));
        assert_eq!(decode_one(b":1000\r\n"), Frame::Integer(1000));
        assert_eq!(decode_one(b":-42\r\n"), Frame::Integer(-42));
        assert_eq!(decode_one(b"$5\r\nhello\r\n"), Frame::bulk("hello"));
        assert_eq!(decode_one(b"$0\r\n\r\n"), Frame::bulk(""));
        assert_eq!(decode_one(b"#t\r\n"), Frame::Boolean(true));
        assert_eq!(decode_one(b"#f\r\n"), Frame::Boolean(false));
        assert_eq!(decode_one(b"_\r\n"), Frame::Null);
        assert_eq!(decode_one(b",3.25\r\n"), Frame::Double(3.25));
        assert_eq!(
            decode_one(b"(3492890328409238509324850943850943825024385\r\n"),
            Frame::BigNumber(Bytes::from_static(
                b"3492890328409238509324850943850943825024385"
            ))
        );
    }

    #[test]
    fn double_special_tokens() {
        assert_eq!(decode_one(b",inf\r\n"), Frame::Double(f64::INFINITY));
        assert_eq!(decode_one(b",-inf\r\n"), Frame::Double(f64::NEG_INFINITY));
        match decode_one(b",nan\r\n") {
            Frame::Double(d) => assert!(d.is_nan()),
            other => panic!("expected double, got {other:?}"),
        }
    }

    #[test]
    fn resp2_nils_decode_as_null() {
        assert_eq!(decode_one(b"$-1\r\n"), Frame::Null);
        assert_eq!(decode_one(b"*-1\r\n"), Frame::Null);
    }

    #[test]
    fn aggregates_preserve_wire_order() {
        let frame = decode_one(b"%2\r\n+b\r\n:2\r\n+a\r\n:1\r\n");
        assert_eq!(
            frame,
            Frame::Map(vec![
                (Frame::simple("b"), Frame::Integer(2)),
                (Frame::simple("a"), Frame::Integer(1)),
            ])
        );

        let frame = decode_one(b"~3\r\n+c\r\n+a\r\n+b\r\n");
        assert_eq!(
            frame,
            Frame::Set(vec![
                Frame::simple("c"),
                Frame::simple("a"),
                Frame::simple("b"),
            ])
        );
    }

    #[test]
    fn verbatim_strings_keep_format() {
        let frame = decode_one(b"=15\r\ntxt:Some string\r\n");
        assert_eq!(
            frame,
            Frame::Verbatim {
                format: *b"txt",
                data: Bytes::from_static(b"Some string"),
            }
        );
    }

    #[test]
    fn attributes_wrap_the_following_frame() {
        let frame = decode_one(b"|1\r\n+ttl\r\n:3600\r\n$5\r\nvalue\r\n");
        assert_eq!(
            frame,
            Frame::Attribute {
                attrs: vec![(Frame::simple("ttl"), Frame::Integer(3600))],
                inner: Box::new(Frame::bulk("value")),
            }
        );
    }

    #[test]
    fn push_frames_are_tagged() {
        let frame = decode_one(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n");
        assert_eq!(
            frame,
            Frame::Push(vec![
                Frame::bulk("message"),
                Frame::bulk("ch"),
                Frame::bulk("hello"),
            ])
        );
    }

    #[test]
    fn blob_errors_classify_like_line_errors() {
        let frame = decode_one(b"!21\r\nWRONGTYPE bad request\r\n");
        match frame {
            Frame::Error(e) => {
                assert_eq!(e.kind, crate::ServerErrorKind::WrongType);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn integer_overflow_is_a_protocol_error() {
        let mut decoder = Decoder::new();
        decoder.extend(b":92233720368547758080\r\n");
        assert_eq!(decoder.decode(), Err(DecodeError::IntegerOverflow));
    }

    #[test]
    fn unknown_prefix_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.extend(b"@oops\r\n");
        assert_eq!(decoder.decode(), Err(DecodeError::InvalidPrefix(b'@')));
    }

    #[test]
    fn depth_limit_rejects_pathological_nesting() {
        let mut input = Vec::new();
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        let mut decoder = Decoder::new();
        decoder.extend(&input);
        assert_eq!(decoder.decode(), Err(DecodeError::DepthExceeded));
    }

    #[test]
    fn bulk_without_terminator_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.extend(b"$3\r\nfooXY");
        assert_eq!(decoder.decode(), Err(DecodeError::MissingTerminator));
    }

    /// Replies and pushes interleaved on the same stream, fed one byte at a
    /// time, must come out classified and in order regardless of where the
    /// read boundaries fall.
    #[test]
    fn interleaved_pushes_and_replies_at_arbitrary_boundaries() {
        let stream: &[u8] = b"+OK\r\n\
            >3\r\n$7\r\nmessage\r\n$1\r\nc\r\n$5\r\nhello\r\n\
            :7\r\n\
            >4\r\n$8\r\npmessage\r\n$2\r\nc*\r\n$2\r\nc1\r\n$2\r\nhi\r\n\
            $3\r\nend\r\n";

        let mut decoder = Decoder::new();
        let mut frames = Vec::new();
        for &byte in stream {
            decoder.extend(&[byte]);
            while let Some(frame) = decoder.decode().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 5);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Frame::Push(_)));
        assert_eq!(frames[2], Frame::Integer(7));
        assert!(matches!(frames[3], Frame::Push(_)));
        assert_eq!(frames[4], Frame::bulk("end"));
    }

    #[test]
    fn partial_frame_keeps_tail_for_next_call() {
        let mut decoder = Decoder::new();
        decoder.extend(b"$5\r\nhel");
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.extend(b"lo\r\n+OK");
        assert_eq!(decoder.decode().unwrap(), Some(Frame::bulk("hello")));
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.extend(b"\r\n");
        assert!(decoder.decode().unwrap().unwrap().is_ok());
    }

    #[test]
    fn frame_encoding_matches_decoder() {
        let frames = [
            Frame::simple("PONG"),
            Frame::Integer(-9),
            Frame::bulk("payload"),
            Frame::Null,
            Frame::Boolean(true),
            Frame::Double(1.5),
            Frame::Array(vec![Frame::Integer(1), Frame::bulk("two")]),
            Frame::Map(vec![(Frame::bulk("k"), Frame::Integer(1))]),
            Frame::Set(vec![Frame::bulk("a"), Frame::bulk("b")]),
            Frame::Verbatim {
                format: *b"txt",
                data: Bytes::from_static(b"hi"),
            },
        ];
        for frame in frames {
            let mut dst = BytesMut::new();
            encode_frame(&mut dst, &frame);
            assert_eq!(decode_one(&dst), frame, "frame: {}", frame.kind_name());
        }
    }

    #[test]
    fn negative_decimal_encoding() {
        let mut dst = BytesMut::new();
        encode_frame(&mut dst, &Frame::Integer(i64::MIN));
        assert_eq!(&dst[..], b":-9223372036854775808\r\n");
    }
}
