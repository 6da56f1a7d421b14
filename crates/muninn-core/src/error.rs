use std::borrow::Cow;
use std::fmt;

use muninn_proto::{DecodeError, ServerError, ServerErrorKind};

/// Transport-visible error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure, including dial failure and EOF.
    Connection,
    /// The client-side deadline for a request elapsed.
    Timeout,
    /// A transaction was aborted by the server.
    ExecAbort,
    /// The client is already closed.
    Closing,
    /// Invalid construction or configuration; raised before any I/O.
    Config,
    /// Malformed wire data; fatal for the connection that produced it.
    Protocol,
    /// Cluster routing failure (no owner for a slot, exhausted redirects).
    Cluster,
    /// A server error reply, passed through with its original kind.
    Server(ServerErrorKind),
    /// A generic request failure not otherwise classified.
    Request,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connection => f.write_str("connection"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::ExecAbort => f.write_str("exec-abort"),
            ErrorKind::Closing => f.write_str("closing"),
            ErrorKind::Config => f.write_str("configuration"),
            ErrorKind::Protocol => f.write_str("protocol"),
            ErrorKind::Cluster => f.write_str("cluster"),
            ErrorKind::Server(kind) => write!(f, "server ({kind})"),
            ErrorKind::Request => f.write_str("request"),
        }
    }
}

/// The error type used across the client core.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    details: Cow<'static, str>,
}

impl Error {
    pub fn new(kind: ErrorKind, details: impl Into<Cow<'static, str>>) -> Self {
        Error {
            kind,
            details: details.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_closing(&self) -> bool {
        self.kind == ErrorKind::Closing
    }

    /// Build the error for a server error reply.
    ///
    /// `EXECABORT` maps to [`ErrorKind::ExecAbort`]; every other kind passes
    /// through unchanged as [`ErrorKind::Server`].
    pub fn from_server(err: ServerError) -> Self {
        let kind = match err.kind {
            ServerErrorKind::ExecAbort => ErrorKind::ExecAbort,
            other => ErrorKind::Server(other),
        };
        Error::new(kind, err.message_lossy())
    }

    pub(crate) fn closed() -> Self {
        Error::new(ErrorKind::Closing, "client is closed")
    }

    pub(crate) fn timeout() -> Self {
        Error::new(ErrorKind::Timeout, "request deadline elapsed")
    }

    pub(crate) fn disconnected(details: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Connection, details)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.details)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Connection, err.to_string())
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::new(ErrorKind::Protocol, err.to_string())
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::from_server(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn server_errors_pass_through_their_kind() {
        let err = Error::from_server(ServerError::parse(Bytes::from_static(
            b"WRONGTYPE Operation against a key holding the wrong kind of value",
        )));
        assert_eq!(err.kind(), ErrorKind::Server(ServerErrorKind::WrongType));
        assert!(err.details().starts_with("WRONGTYPE"));
    }

    #[test]
    fn execabort_maps_to_its_own_kind() {
        let err = Error::from_server(ServerError::parse(Bytes::from_static(
            b"EXECABORT Transaction discarded because of previous errors.",
        )));
        assert_eq!(err.kind(), ErrorKind::ExecAbort);
    }

    #[test]
    fn display_includes_kind_and_details() {
        let err = Error::new(ErrorKind::Timeout, "request deadline elapsed");
        assert_eq!(err.to_string(), "timeout: request deadline elapsed");
    }
}
