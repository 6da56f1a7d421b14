use std::fmt;

use bytes::Bytes;

/// The contents of a simple-string OK reply.
pub const OK: &str = "OK";

/// The contents of the simple-string reply queued commands receive inside a
/// transaction block.
pub const QUEUED: &str = "QUEUED";

/// Classification of a server error reply.
///
/// The kind is the first whitespace-delimited token of the error line.
/// Anything not recognized collapses to [`ServerErrorKind::Err`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    /// `MOVED <slot> <host:port>`: the slot permanently moved.
    Moved,
    /// `ASK <slot> <host:port>`: one-shot redirect for a migrating slot.
    Ask,
    /// Operation against a key holding the wrong kind of value.
    WrongType,
    /// Authentication required or failed.
    NoAuth,
    /// The cluster is down.
    ClusterDown,
    /// The server is busy running a script or command.
    Busy,
    /// The server is loading its dataset into memory.
    Loading,
    /// Write command sent to a read-only replica.
    Readonly,
    /// The server is out of memory.
    Oom,
    /// The transaction was discarded because of earlier queuing errors.
    ExecAbort,
    /// Any other server error.
    Err,
}

impl ServerErrorKind {
    fn from_token(token: &[u8]) -> Self {
        match token {
            b"MOVED" => ServerErrorKind::Moved,
            b"ASK" => ServerErrorKind::Ask,
            b"WRONGTYPE" => ServerErrorKind::WrongType,
            b"NOAUTH" | b"WRONGPASS" => ServerErrorKind::NoAuth,
            b"CLUSTERDOWN" => ServerErrorKind::ClusterDown,
            b"BUSY" => ServerErrorKind::Busy,
            b"LOADING" => ServerErrorKind::Loading,
            b"READONLY" => ServerErrorKind::Readonly,
            b"OOM" => ServerErrorKind::Oom,
            b"EXECABORT" => ServerErrorKind::ExecAbort,
            _ => ServerErrorKind::Err,
        }
    }

    /// Whether this error is a cluster redirection (`MOVED` or `ASK`).
    pub fn is_redirection(self) -> bool {
        matches!(self, ServerErrorKind::Moved | ServerErrorKind::Ask)
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerErrorKind::Moved => "MOVED",
            ServerErrorKind::Ask => "ASK",
            ServerErrorKind::WrongType => "WRONGTYPE",
            ServerErrorKind::NoAuth => "NOAUTH",
            ServerErrorKind::ClusterDown => "CLUSTERDOWN",
            ServerErrorKind::Busy => "BUSY",
            ServerErrorKind::Loading => "LOADING",
            ServerErrorKind::Readonly => "READONLY",
            ServerErrorKind::Oom => "OOM",
            ServerErrorKind::ExecAbort => "EXECABORT",
            ServerErrorKind::Err => "ERR",
        };
        f.write_str(s)
    }
}

/// A decoded server error reply.
///
/// The codec never raises these; they travel as ordinary frames so the
/// layers above decide whether an error is a redirection to consume, a
/// refresh trigger, or something to hand back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    /// Classification from the first token of the message.
    pub kind: ServerErrorKind,
    /// The full error line as sent by the server, including the kind token.
    pub message: Bytes,
}

impl ServerError {
    /// Classify a raw error line.
    pub fn parse(message: Bytes) -> Self {
        let token_end = message
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(message.len());
        let kind = ServerErrorKind::from_token(&message[..token_end]);
        ServerError { kind, message }
    }

    /// The error line as text, lossy on non-UTF-8 input.
    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.message))
    }
}

impl std::error::Error for ServerError {}

/// Any RESP2 or RESP3 frame, owned.
///
/// RESP2 decodes into the same enum: nil bulk strings and nil arrays become
/// [`Frame::Null`], so the layers above never branch on protocol version.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `+` simple string.
    Simple(Bytes),
    /// `$` bulk string.
    Bulk(Bytes),
    /// `*` array.
    Array(Vec<Frame>),
    /// `%` map, preserving wire order.
    Map(Vec<(Frame, Frame)>),
    /// `~` set, preserving wire order.
    Set(Vec<Frame>),
    /// `:` integer.
    Integer(i64),
    /// `,` double.
    Double(f64),
    /// `#` boolean.
    Boolean(bool),
    /// `(` big number, kept as its decimal string.
    BigNumber(Bytes),
    /// `=` verbatim string with its three-character format tag.
    Verbatim { format: [u8; 3], data: Bytes },
    /// `_` null, or RESP2 nil bulk/array.
    Null,
    /// `-` or `!` error reply.
    Error(ServerError),
    /// `>` server-initiated push.
    Push(Vec<Frame>),
    /// `|` attribute metadata attached to the next frame.
    Attribute {
        attrs: Vec<(Frame, Frame)>,
        inner: Box<Frame>,
    },
}

impl Frame {
    /// Whether this is an `+OK` reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(data) if data.as_ref() == OK.as_bytes())
    }

    /// Whether this is a `+QUEUED` reply.
    pub fn is_queued(&self) -> bool {
        matches!(self, Frame::Simple(data) if data.as_ref() == QUEUED.as_bytes())
    }

    /// Whether this is a cluster redirection error.
    pub fn is_redirection(&self) -> bool {
        matches!(self, Frame::Error(e) if e.kind.is_redirection())
    }

    /// The raw bytes of string-like frames.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::Simple(data)
            | Frame::Bulk(data)
            | Frame::BigNumber(data)
            | Frame::Verbatim { data, .. } => Some(data),
            Frame::Error(e) => Some(&e.message),
            Frame::Attribute { inner, .. } => inner.as_bytes(),
            _ => None,
        }
    }

    /// String-like frames as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Strip attribute metadata, returning the inner frame.
    pub fn into_inner(self) -> Frame {
        match self {
            Frame::Attribute { inner, .. } => inner.into_inner(),
            other => other,
        }
    }

    /// If this frame is a server error, take it.
    pub fn into_error(self) -> Result<Frame, ServerError> {
        match self {
            Frame::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    /// Short human-readable name of the frame kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple",
            Frame::Bulk(_) => "bulk",
            Frame::Array(_) => "array",
            Frame::Map(_) => "map",
            Frame::Set(_) => "set",
            Frame::Integer(_) => "integer",
            Frame::Double(_) => "double",
            Frame::Boolean(_) => "boolean",
            Frame::BigNumber(_) => "bignumber",
            Frame::Verbatim { .. } => "verbatim",
            Frame::Null => "null",
            Frame::Error(_) => "error",
            Frame::Push(_) => "push",
            Frame::Attribute { .. } => "attribute",
        }
    }

    /// Build a simple-string frame from a static token.
    pub fn simple(s: &'static str) -> Frame {
        Frame::Simple(Bytes::from_static(s.as_bytes()))
    }

    /// Build a bulk frame by copying the provided bytes.
    pub fn bulk(data: impl AsRef<[u8]>) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(data.as_ref()))
    }
}
