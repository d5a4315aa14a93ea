//! Streaming connection error types
//!
//! Network and protocol errors are handled locally by the connection (logged
//! and turned into state transitions). `is_connection_lost` tells the
//! connection which of them warrant a reconnect.

use thiserror::Error;

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Streaming connection errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Heartbeat payload already set")]
    HeartbeatAlreadySet,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Connection closed by caller")]
    ClosedByCaller,
}

impl StreamError {
    /// Errors meaning the socket is gone and a reconnect is due
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset(_) | Self::ConnectionClosed(_) | Self::NetworkError(_) | Self::TlsError(_)
        )
    }

    /// Classify an I/O error from a socket operation
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                Self::ConnectionReset(format!("{context}: {err}"))
            }
            ErrorKind::UnexpectedEof => Self::ConnectionClosed(format!("{context}: {err}")),
            _ => Self::NetworkError(format!("{context}: {err}")),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<rustls::Error> for StreamError {
    fn from(err: rustls::Error) -> Self {
        Self::TlsError(err.to_string())
    }
}

impl From<tickstream_core::CoreError> for StreamError {
    fn from(err: tickstream_core::CoreError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}
