//! Error type shared by the codec, the multiplexer and the session.

use crate::session::State;

/// Result alias using the crate [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the 9P engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A field claimed more bytes than the buffer holds.
    #[error("truncated input")]
    TruncatedInput,

    /// A frame header is inconsistent with the stream or the negotiated size.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A string does not fit the 16-bit length prefix.
    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),

    /// The peer answered with `Rerror` or `Rlerror`.
    #[error("remote error: {message} (code {code})")]
    Protocol { message: String, code: u32 },

    /// Every non-sentinel tag is in flight.
    #[error("tag space exhausted")]
    TagSpaceExhausted,

    /// The transport failed or the session was shut down.
    #[error("connection lost")]
    ConnectionLost,

    /// Version exchange did not converge.
    #[error("version negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A request was issued outside the `Ready` state.
    #[error("session not ready (state {0:?})")]
    NotReady(State),

    #[error("unexpected response type {got} (expected {expected})")]
    UnexpectedResponse { expected: u8, got: u8 },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// The request was flushed before it completed.
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    TimedOut,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Remote error code for protocol errors.
    pub fn errno(&self) -> Option<u32> {
        match self {
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost | Error::NegotiationFailed(_) | Error::Io(_)
        )
    }
}
