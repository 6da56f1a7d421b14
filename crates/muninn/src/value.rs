//! Decoded reply values.
//!
//! Frames decode into [`Value`] according to the configured decoder:
//! `Bytes` keeps bulk payloads raw, `Text` upgrades valid UTF-8 to
//! strings and silently keeps bytes otherwise. Server error frames never
//! become values; they surface as typed errors.

use bytes::Bytes;
use muninn_core::{DecodeMode, Error, ErrorKind, ResponseTransform};
use muninn_proto::Frame;

/// A decoded server reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    /// Status strings (`OK`, `PONG`).
    Simple(String),
    Bytes(Bytes),
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    BigNumber(String),
    Array(Vec<Value>),
    /// Unordered unique collection; produced by RESP3 set frames and by
    /// set-conversion of array replies.
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

fn type_error(expected: &str, got: &Value) -> Error {
    Error::new(
        ErrorKind::Protocol,
        format!("expected {expected} reply, got {got:?}"),
    )
}

impl Value {
    /// Decode a frame, surfacing server errors as typed errors.
    pub fn from_frame(frame: Frame, mode: DecodeMode) -> Result<Value, Error> {
        let value = match frame {
            Frame::Error(error) => return Err(Error::from_server(error)),
            Frame::Null => Value::Null,
            Frame::Simple(data) => Value::Simple(String::from_utf8_lossy(&data).into_owned()),
            Frame::Bulk(data) | Frame::Verbatim { data, .. } => decode_blob(data, mode),
            Frame::Integer(value) => Value::Integer(value),
            Frame::Double(value) => Value::Double(value),
            Frame::Boolean(value) => Value::Boolean(value),
            Frame::BigNumber(data) => Value::BigNumber(String::from_utf8_lossy(&data).into_owned()),
            Frame::Array(items) | Frame::Push(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| Value::from_frame(item, mode))
                    .collect::<Result<_, _>>()?,
            ),
            Frame::Set(items) => Value::Set(
                items
                    .into_iter()
                    .map(|item| Value::from_frame(item, mode))
                    .collect::<Result<_, _>>()?,
            ),
            Frame::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(key, value)| {
                        Ok::<(Value, Value), Error>((Value::from_frame(key, mode)?, Value::from_frame(value, mode)?))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Frame::Attribute { inner, .. } => Value::from_frame(*inner, mode)?,
        };
        Ok(value)
    }

    /// Decode and apply the catalog's post-transform.
    pub fn decode(frame: Frame, mode: DecodeMode, transform: ResponseTransform) -> Result<Value, Error> {
        let value = Value::from_frame(frame, mode)?;
        Ok(match transform {
            ResponseTransform::None => value,
            ResponseTransform::ToSet => value.into_set(),
        })
    }

    /// Canonicalize an array into a set: unique elements, first-seen
    /// order. Sets pass through; anything else is unchanged.
    pub fn into_set(self) -> Value {
        match self {
            Value::Array(items) => {
                let mut unique: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
                Value::Set(unique)
            }
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// `OK` status check.
    pub fn into_ok(self) -> Result<(), Error> {
        match self {
            Value::Simple(status) if status == "OK" => Ok(()),
            other => Err(type_error("OK", &other)),
        }
    }

    pub fn into_integer(self) -> Result<i64, Error> {
        match self {
            Value::Integer(value) => Ok(value),
            Value::Bytes(ref data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| type_error("integer", &self)),
            Value::Text(ref text) => text
                .parse()
                .map_err(|_| type_error("integer", &self)),
            other => Err(type_error("integer", &other)),
        }
    }

    /// Numeric replies arrive as doubles in RESP3 and as strings in
    /// RESP2; accept both.
    pub fn into_double(self) -> Result<f64, Error> {
        match self {
            Value::Double(value) => Ok(value),
            Value::Integer(value) => Ok(value as f64),
            Value::Bytes(ref data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| type_error("double", &self)),
            Value::Text(ref text) => text.parse().map_err(|_| type_error("double", &self)),
            other => Err(type_error("double", &other)),
        }
    }

    /// Boolean-shaped replies: RESP3 booleans or RESP2 0/1 integers.
    pub fn into_bool(self) -> Result<bool, Error> {
        match self {
            Value::Boolean(value) => Ok(value),
            Value::Integer(value) => Ok(value != 0),
            other => Err(type_error("boolean", &other)),
        }
    }

    /// The raw bytes of blob-like values.
    pub fn into_bytes(self) -> Result<Bytes, Error> {
        match self {
            Value::Bytes(data) => Ok(data),
            Value::Text(text) => Ok(Bytes::from(text)),
            Value::Simple(status) => Ok(Bytes::from(status)),
            other => Err(type_error("bulk", &other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Value>, Error> {
        match self {
            Value::Array(items) | Value::Set(items) => Ok(items),
            other => Err(type_error("array", &other)),
        }
    }

    /// Blob payload as text, lossy.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Bytes(data) => Some(String::from_utf8_lossy(data).into_owned()),
            Value::Text(text) => Some(text.clone()),
            Value::Simple(status) => Some(status.clone()),
            _ => None,
        }
    }
}

fn decode_blob(data: Bytes, mode: DecodeMode) -> Value {
    match mode {
        DecodeMode::Bytes => Value::Bytes(data),
        DecodeMode::Text => match String::from_utf8(data.to_vec()) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Bytes(data),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_decoding_respects_mode() {
        let frame = Frame::bulk("hello");
        assert_eq!(
            Value::from_frame(frame.clone(), DecodeMode::Bytes).unwrap(),
            Value::Bytes(Bytes::from_static(b"hello"))
        );
        assert_eq!(
            Value::from_frame(frame, DecodeMode::Text).unwrap(),
            Value::Text("hello".into())
        );
        // Invalid UTF-8 falls back to bytes even in text mode.
        let frame = Frame::Bulk(Bytes::from_static(b"\xff\xfe"));
        assert_eq!(
            Value::from_frame(frame, DecodeMode::Text).unwrap(),
            Value::Bytes(Bytes::from_static(b"\xff\xfe"))
        );
    }

    #[test]
    fn set_conversion_dedupes_preserving_order() {
        let value = Value::Array(vec![
            Value::Integer(2),
            Value::Integer(1),
            Value::Integer(2),
        ]);
        assert_eq!(
            value.into_set(),
            Value::Set(vec![Value::Integer(2), Value::Integer(1)])
        );
    }

    #[test]
    fn error_frames_become_typed_errors() {
        let frame = Frame::Error(muninn_proto::ServerError::parse(Bytes::from_static(
            b"WRONGTYPE nope",
        )));
        let err = Value::from_frame(frame, DecodeMode::Bytes).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Server(muninn_proto::ServerErrorKind::WrongType)
        );
    }

    #[test]
    fn bool_accepts_both_protocol_shapes() {
        assert!(Value::Boolean(true).into_bool().unwrap());
        assert!(Value::Integer(1).into_bool().unwrap());
        assert!(!Value::Integer(0).into_bool().unwrap());
    }

    #[test]
    fn double_accepts_string_scores() {
        assert_eq!(
            Value::Bytes(Bytes::from_static(b"1.5")).into_double().unwrap(),
            1.5
        );
        assert_eq!(Value::Double(2.5).into_double().unwrap(), 2.5);
    }
}
