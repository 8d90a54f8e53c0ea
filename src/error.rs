//! Error types for the relay library.

use std::fmt;

/// Errors that can occur across the relay stack.
///
/// Variants map to the failure taxonomy of the system:
///
/// - **Protocol**: [`Status`](Self::Status) — a non-success RTSP reply,
///   delivered through the pending request's error path, never retried.
/// - **Connection**: [`ConnectionClosed`](Self::ConnectionClosed),
///   [`RequestTimeout`](Self::RequestTimeout) — the control connection was
///   lost or a reply deadline expired.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures.
/// - **Resource**: [`SourceExhausted`](Self::SourceExhausted) — a media
///   source was pulled past its last unit.
/// - **Parse**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered with a non-success RTSP status.
    #[error("RTSP error status: {code} {reason}")]
    Status { code: u16, reason: String },

    /// The control connection closed while requests were outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request's per-request deadline expired before a reply arrived.
    #[error("request timed out")]
    RequestTimeout,

    /// `next()` was called on a source with no more units.
    #[error("media source exhausted")]
    SourceExhausted,

    /// Target URL could not be interpreted as `rtsp://host[:port]/path`.
    #[error("invalid RTSP URL: {0}")]
    InvalidUrl(String),

    /// Failed to parse an RTSP message (RFC 2326 §4).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request or status line).
    EmptyMessage,
    /// Request line did not have the `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The CSeq header was missing or not an integer.
    InvalidCseq,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidCseq => write!(f, "missing or invalid CSeq"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
