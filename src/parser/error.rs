//! Error types for the HTTP parser.

use thiserror::Error;

/// Errors that can occur while parsing an HTTP request or reading its body.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP verb in the request is not part of the supported enumeration.
    #[error("Invalid HTTP verb: {0}")]
    InvalidVerb(String),

    /// The request line does not contain method, URL and version.
    #[error("Malformed request line: {0}")]
    MalformedRequest(String),

    /// The HTTP version in the request is not supported.
    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    /// A header in the request has an invalid format.
    #[error("Invalid header format: {0}")]
    InvalidHeaderFormat(String),

    /// The Content-Length header is not a valid number.
    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// The request head exceeded the configured size limit.
    #[error("Request head exceeds {0} bytes")]
    HeadersTooLarge(usize),

    /// The request is empty.
    #[error("Empty request")]
    EmptyRequest,

    /// The body ended before Content-Length bytes were read.
    #[error("Incomplete body: expected {expected} bytes, read {read}")]
    IncompleteBody { expected: u64, read: u64 },

    /// A chunk length line could not be parsed as hex.
    #[error("Invalid chunk length: {0}")]
    InvalidChunkLength(String),

    /// A chunk contained fewer bytes than its length line declared.
    #[error("Expected {expected} bytes but only read {read} bytes in chunk")]
    ChunkLengthMismatch { expected: usize, read: usize },

    /// The final chunk has already been read.
    #[error("Chunk stream already finished")]
    ChunkStreamFinished,

    /// The request is not chunk transfer-encoded.
    #[error("Request is not chunk transfer-encoded")]
    NotChunked,

    /// I/O error while reading from the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}
