//! Error types for the Tether transport.
//!
//! Errors are attributed to the narrowest scope possible: one call, one topic,
//! one application. Only a real transport break is allowed to affect every
//! stream on a connection.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Tether core library.
#[derive(Debug, Error)]
pub enum TetherError {
    // Transport errors
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("WebSocket error: {message}")]
    WebSocket {
        message: String,
        #[source]
        source: Option<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Stream lifecycle errors
    #[error("Stream {id} was already started")]
    AlreadyStarted { id: String },

    #[error("Stream {id} closed before the call was confirmed")]
    StreamClosed { id: String },

    #[error("Call {id} was rejected: {message}")]
    CallRejected { id: String, message: String },

    #[error("Stream method {method} is already registered")]
    DuplicateMethod { method: String },

    // Pub/sub errors
    #[error("Topic already exists: {topic}")]
    TopicExists { topic: String },

    #[error("Topic does not exist: {topic}")]
    TopicNotFound { topic: String },

    #[error("Topic is closed: {topic}")]
    TopicClosed { topic: String },

    // Persistence errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TetherError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TetherError::WebSocket {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<url::ParseError> for TetherError {
    fn from(err: url::ParseError) -> Self {
        TetherError::Config {
            message: format!("invalid URL: {}", err),
        }
    }
}

impl TetherError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TetherError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC style error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Transport error (connection lost, websocket failure, timeout)
    /// - -32001: Stream lifecycle misuse
    /// - -32002: Topic not found or closed
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TetherError::ConnectionClosed { .. }
            | TetherError::WebSocket { .. }
            | TetherError::Timeout(_) => -32000,

            TetherError::AlreadyStarted { .. }
            | TetherError::StreamClosed { .. }
            | TetherError::CallRejected { .. }
            | TetherError::DuplicateMethod { .. } => -32001,

            TetherError::TopicExists { .. }
            | TetherError::TopicNotFound { .. }
            | TetherError::TopicClosed { .. } => -32002,

            TetherError::Validation { .. } => -32005,

            TetherError::Json { .. } => -32700,

            _ => -32603,
        }
    }

    /// Whether the failure was caused by the transport rather than the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TetherError::ConnectionClosed { .. }
                | TetherError::WebSocket { .. }
                | TetherError::Timeout(_)
        )
    }
}
