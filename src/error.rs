use thiserror::Error;

/// Errors surfaced by session and stream operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, reserved tag, duplicate stream id, etc.)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame payload exceeds the configured maximum
    #[error("message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    /// Remote side closed the stream gracefully and all data has been read
    #[error("end of stream")]
    Eof,

    /// Stream was reset, locally or by the peer
    #[error("stream reset")]
    Reset,

    /// Read or write deadline expired on the current operation
    #[error("operation timed out")]
    Timeout,

    /// Write attempted after the local side was closed
    #[error("cannot write to closed stream")]
    ClosedLocal,

    /// Deadline set on a side of the stream that is already closed
    #[error("stream closed")]
    StreamClosed,

    /// Operation on a session that has shut down
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Whether this error terminates the whole session.
    ///
    /// Framing integrity cannot be assumed after a transport or protocol
    /// failure, so these errors reset every stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::MessageTooLarge(_, _)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
