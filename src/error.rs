//! Error types for muxreq crate.

use std::io;
use std::time::Duration;

use crate::abort::AbortKind;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching multiplexed requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was cancelled through its abort signal.
    #[error("Request aborted ({kind}): {message}")]
    Aborted { kind: AbortKind, message: String },

    /// Dialing the endpoint failed.
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Connect did not complete within the configured timeout.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// The session errored or closed underneath a request.
    #[error("Session error: {0}")]
    Session(String),

    /// Generic connection error (session unusable, closed before headers).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Error confined to a single stream.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Response headers did not arrive in time.
    #[error("TTFB timeout after {0:?} - server did not respond with headers")]
    TtfbTimeout(Duration),

    /// HTTP protocol error.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// The request could not be turned into a stream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification callers can branch on without reading messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cancellation took effect; carries its source.
    Aborted(AbortKind),
    /// The connection to the endpoint failed or went away.
    Connection,
    /// Only the request's own stream failed.
    Stream,
    /// Response headers were not received in time.
    Timeout,
    /// The peer violated the protocol.
    Protocol,
    /// The request was rejected before being sent.
    InvalidRequest,
    /// Local I/O failure.
    Io,
}

impl Error {
    /// Create an abort error.
    pub fn aborted(kind: AbortKind) -> Self {
        Self::Aborted {
            kind,
            message: format!("request aborted by {}", kind),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a dial error.
    pub fn dial(message: impl Into<String>) -> Self {
        Self::Dial(message.into())
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a stream error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Aborted { kind, .. } => ErrorKind::Aborted(*kind),
            Self::Dial(_) | Self::ConnectTimeout(_) | Self::Session(_) | Self::Connection(_) => {
                ErrorKind::Connection
            }
            Self::Stream(_) => ErrorKind::Stream,
            Self::TtfbTimeout(_) => ErrorKind::Timeout,
            Self::HttpProtocol(_) => ErrorKind::Protocol,
            Self::InvalidRequest(_) | Self::UrlParse(_) => ErrorKind::InvalidRequest,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// True if cancellation caused this error.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// True if the connection (not just one stream) failed.
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}
