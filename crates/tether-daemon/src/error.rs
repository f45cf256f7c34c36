//! Error types for daemon processes and their supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the daemon crate.
#[derive(Debug, Error)]
pub enum DaemonError {
    // Registration errors
    #[error("Method {server_file}.{method} is already registered")]
    DuplicateMethod { server_file: String, method: String },

    #[error("No methods are registered")]
    EmptyRegistry,

    // Dispatch errors
    #[error("No methods found for file {server_file}")]
    UnknownFile { server_file: String },

    #[error("No method found for {server_file}.{method}")]
    UnknownMethod { server_file: String, method: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{message}")]
    Method { message: String },

    // Lifecycle errors
    #[error("Startup handler '{name}' failed: {message}")]
    StartupHandlerFailed { name: String, message: String },

    #[error("Failed to spawn daemon for {app_id}: {message}")]
    Spawn { app_id: String, message: String },

    #[error("Daemon for {app_id} did not report a port: {message}")]
    PortDiscovery { app_id: String, message: String },

    #[error("Daemon at {url} did not become healthy")]
    Unhealthy { url: String },

    #[error("Unknown app: {app_id}")]
    UnknownApp { app_id: String },

    // Remote errors
    #[error("Daemon is unavailable: {message}")]
    Unavailable { message: String },

    #[error("Daemon method failed: {message}")]
    Remote { message: String },

    #[error("HTTP error: {message}")]
    Http {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // File system errors
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
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for DaemonError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            return DaemonError::Unavailable {
                message: err.to_string(),
            };
        }
        DaemonError::Http {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl DaemonError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DaemonError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC style error code.
    ///
    /// - -32601: Unknown app, file or method
    /// - -32602: Invalid input
    /// - -32603: Internal error
    /// - -32000: Daemon unreachable or unhealthy
    /// - -32003: Method or startup failure
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            DaemonError::UnknownApp { .. }
            | DaemonError::UnknownFile { .. }
            | DaemonError::UnknownMethod { .. } => -32601,

            DaemonError::InvalidInput { .. } => -32602,

            DaemonError::Unavailable { .. }
            | DaemonError::Unhealthy { .. }
            | DaemonError::Http { .. }
            | DaemonError::Spawn { .. }
            | DaemonError::PortDiscovery { .. } => -32000,

            DaemonError::Method { .. }
            | DaemonError::Remote { .. }
            | DaemonError::StartupHandlerFailed { .. } => -32003,

            _ => -32603,
        }
    }
}
