//! Error types for the HTTP server.

use std::time::Duration;

use thiserror::Error;

use crate::parser::Error as ParserError;

/// Errors that can occur during HTTP server operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error parsing an HTTP request.
    #[error("Parse error: {0}")]
    ParseError(#[from] ParserError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An endpoint path was empty.
    #[error("Endpoint path must not be empty")]
    EmptyPath,

    /// The configured port is outside 1-65535.
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// A handler did not finish within the server timeout.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was cancelled before the request completed.
    #[error("Connection cancelled")]
    Cancelled,

    /// Internal server error.
    #[error("Internal server error: {0}")]
    InternalError(String),

    /// A WebSocket operation failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
