//! Client side errors.
//!
//! Errors fall into two groups. Connection-fatal errors (`MalformedMessage`,
//! `ProtocolViolation`, I/O failures) tear the whole connection down and every
//! waiter observes `ConnectionClosed`. Everything else is local to the single
//! operation that produced it.

use std::{fmt, io};

use crate::fcall::MsgType;

/// Client error type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An I/O error on the underlying stream.
    ///
    /// Kept as kind and text so one teardown cause can be handed to many waiters.
    #[error("I/O error: {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// Framing or decoding failure.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The server broke the request/response contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered with `RError`.
    #[error("{0}")]
    ServerRejected(String),

    /// The connection failed or was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request outlived the configured deadline; the connection was torn down.
    #[error("request timed out")]
    TimedOut,

    /// The server does not speak the requested protocol version.
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),

    /// An encoded request does not fit in the negotiated msize.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The request could not be encoded; nothing was sent.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Every usable tag is held by a pending request.
    #[error("no free tags")]
    TagsExhausted,

    /// Every usable fid number is live.
    #[error("no free fids")]
    FidsExhausted,

    /// The handle was used after its retirement was initiated.
    #[error("fid {0} already closed")]
    FidClosed(u32),

    /// A fid lifecycle transition was requested from the wrong state.
    #[error("fid {fid} is {state}")]
    InvalidFidState { fid: u32, state: String },

    /// A walk was given more than `MAXWELEM` names.
    #[error("too many walk names ({0})")]
    TooManyWalkNames(usize),

    /// A walk stopped before reaching the named element.
    #[error("file '{0}' not found")]
    NotFound(String),

    /// The server accepted zero bytes of a write.
    #[error("short write")]
    ShortWrite,
}

impl Error {
    /// True if this error tears down the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            *self,
            Error::Io { .. }
                | Error::MalformedMessage(_)
                | Error::ProtocolViolation(_)
                | Error::ConnectionClosed
                | Error::TimedOut
        )
    }

    pub(crate) fn unexpected(expected: MsgType, got: impl fmt::Debug) -> Error {
        Error::ProtocolViolation(format!("expected {:?}, got {:?}", expected, got))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Convert a codec level error into the connection's view of it.
///
/// Decoding errors (bad type, short body, bad UTF-8, length mismatch) are all
/// framing failures. Other kinds come from the stream itself.
pub(crate) fn from_codec(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            Error::MalformedMessage(e.to_string())
        }
        _ => Error::from(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_are_malformed() {
        let e = from_codec(io::Error::new(io::ErrorKind::InvalidData, "bad type"));
        assert_eq!(e, Error::MalformedMessage("bad type".to_owned()));
        assert!(e.is_fatal());

        let e = from_codec(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(e, Error::Io { kind: io::ErrorKind::BrokenPipe, .. }));
    }

    #[test]
    fn server_rejection_is_verbatim_and_local() {
        let e = Error::ServerRejected("duplicate fid".to_owned());
        assert_eq!(e.to_string(), "duplicate fid");
        assert!(!e.is_fatal());
    }
}
