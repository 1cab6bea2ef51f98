//! Error types for the connection manager.

use thiserror::Error;

/// Errors surfaced by connections and transports.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// Initial or repeated connection failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation requires an open transport
    #[error("Not connected to the server")]
    NotConnected,

    /// A request/response wait expired or was aborted before a match arrived
    #[error("No response received within the request timeout")]
    RequestTimeout,

    /// JSON deserialization failure
    #[error("Failed to parse message: {0}")]
    MessageParseError(String),

    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    /// Invalid URL
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Connect handshake timed out
    #[error("Operation timed out")]
    Timeout,

    /// Internal channel closed
    #[error("Internal channel closed")]
    ChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for SocketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => SocketError::NotConnected,
            Error::Io(e) => SocketError::Io(e.to_string()),
            Error::Protocol(e) => SocketError::Protocol(e.to_string()),
            Error::Url(e) => SocketError::InvalidUrl(e.to_string()),
            Error::Http(resp) => {
                SocketError::ConnectionFailed(format!("HTTP error: {:?}", resp.status()))
            }
            Error::HttpFormat(e) => SocketError::ConnectionFailed(e.to_string()),
            other => SocketError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SocketError {
    fn from(err: serde_json::Error) -> Self {
        SocketError::MessageParseError(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SocketError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SocketError::ChannelClosed
    }
}

/// Result type alias for connection operations
pub type SocketResult<T> = Result<T, SocketError>;

/// Opaque error type returned by subscription message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
