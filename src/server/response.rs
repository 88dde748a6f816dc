//! HTTP response types and the outbound side of a connection.
//!
//! An [`HttpResponse`] owns a shared [`ResponseSink`]. The status line and headers go out
//! at most once: the first `send*` call writes them under the sink lock and every later
//! attempt is a silent no-op. Bodies are framed either with `Content-Length` (the
//! buffered sends) or with chunked transfer encoding (streams, files and explicit
//! chunks).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::server::config::DEFAULT_STREAM_BUFFER_SIZE;
use crate::server::error::Error;

/// The write side of a connection.
pub type ResponseWriter = Box<dyn AsyncWrite + Send + Unpin>;

const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// An HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// The numeric code.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Get the reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            413 => "Payload Too Large",
            415 => "Unsupported Media Type",
            422 => "Unprocessable Entity",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Structured error body sent by [`HttpResponse::send_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfoMessage {
    pub http_status_code: u16,
    pub error_code: i32,
    pub error_message: String,
    pub error_help_url: String,
}

impl ErrorInfoMessage {
    pub fn new(status: StatusCode, message: &str, error_code: i32, help_url: &str) -> Self {
        Self {
            http_status_code: status.as_u16(),
            error_code,
            error_message: message.to_string(),
            error_help_url: help_url.to_string(),
        }
    }
}

struct SinkState {
    writer: Option<ResponseWriter>,
    headers_sent: bool,
    chunked: bool,
}

impl SinkState {
    /// Write to the client. A failed write drops the writer, turning every later
    /// write into a no-op.
    async fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        if let Err(e) = writer.write_all(bytes).await {
            debug!("Client went away while writing response: {e}");
            self.writer = None;
            return false;
        }
        true
    }

    async fn send_headers(&mut self, block: &[u8], chunked: bool) {
        if self.headers_sent || self.writer.is_none() {
            return;
        }
        self.write(block).await;
        self.headers_sent = true;
        self.chunked = chunked;
    }

    async fn write_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut framed = format!("{:x}\r\n", data.len()).into_bytes();
        framed.extend_from_slice(data);
        framed.extend_from_slice(b"\r\n");
        self.write(&framed).await;
    }

    async fn finish(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush().await {
                debug!("Error flushing response: {e}");
            }
            let _ = writer.shutdown().await;
        }
    }
}

/// The outbound byte sink of one connection, shared between the handler's
/// [`HttpResponse`] and the dispatcher.
pub struct ResponseSink {
    state: Mutex<SinkState>,
}

impl ResponseSink {
    pub fn new(writer: ResponseWriter) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SinkState {
                writer: Some(writer),
                headers_sent: false,
                chunked: false,
            }),
        })
    }

    /// Whether the status line and headers have gone out.
    pub async fn headers_sent(&self) -> bool {
        self.state.lock().await.headers_sent
    }

    /// Whether the client can still be written to.
    pub async fn is_writable(&self) -> bool {
        self.state.lock().await.writer.is_some()
    }

    /// Best-effort flush and shutdown. Safe to call any number of times.
    pub async fn close(&self) {
        self.state.lock().await.finish().await;
    }

    /// Hand the writer over to another protocol. Headers count as sent afterwards.
    pub async fn take_writer(&self) -> Option<ResponseWriter> {
        let mut state = self.state.lock().await;
        state.headers_sent = true;
        state.writer.take()
    }
}

/// Represents an HTTP response.
///
/// Status, headers and content type may be changed freely until the first `send*`
/// call; after that, changes are no longer visible to the client.
pub struct HttpResponse {
    /// The HTTP status code, 200 unless changed
    pub status_code: StatusCode,
    /// Additional response headers
    pub headers: HashMap<String, String>,
    /// The Content-Type header, `application/json` unless changed
    pub content_type: String,
    content_length: u64,
    head_request: bool,
    server_name: String,
    stream_buffer_size: usize,
    cancellation: CancellationToken,
    sink: Arc<ResponseSink>,
}

impl HttpResponse {
    /// Create a response writing to `sink`.
    ///
    /// # Arguments
    ///
    /// * `sink` - The outbound side of the connection
    /// * `head_request` - Whether the request was `HEAD`; body bytes are then suppressed
    pub fn new(sink: Arc<ResponseSink>, head_request: bool) -> Self {
        Self {
            status_code: StatusCode::OK,
            headers: HashMap::new(),
            content_type: "application/json".to_string(),
            content_length: 0,
            head_request,
            server_name: "embedhttp".to_string(),
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            cancellation: CancellationToken::new(),
            sink,
        }
    }

    pub(crate) fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub(crate) fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }

    /// Stop streamed sends once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Add or replace a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Bytes of body sent so far (or announced, for `HEAD`).
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The shared sink behind this response.
    pub fn sink(&self) -> &Arc<ResponseSink> {
        &self.sink
    }

    /// Whether the status line and headers have gone out.
    pub async fn headers_sent(&self) -> bool {
        self.sink.headers_sent().await
    }

    /// Send headers and an empty body, then close the connection.
    pub async fn send(&mut self) {
        self.send_body(&[]).await;
    }

    /// Send the given status with an empty body, then close the connection.
    pub async fn send_status(&mut self, status: StatusCode) {
        self.status_code = status;
        self.send().await;
    }

    /// Send a plain-text message with the given status.
    pub async fn send_message(&mut self, status: StatusCode, message: &str) {
        self.status_code = status;
        self.content_type = "text/plain".to_string();
        self.send_body(message.as_bytes()).await;
    }

    /// Send `content` with an explicit status and MIME type.
    pub async fn send_content(&mut self, status: StatusCode, content: &str, mime_type: &str) {
        self.status_code = status;
        self.send_string(content, mime_type).await;
    }

    /// Send an [`ErrorInfoMessage`] as JSON.
    pub async fn send_error(
        &mut self,
        status: StatusCode,
        message: &str,
        error_code: i32,
        help_url: &str,
    ) -> Result<(), Error> {
        self.status_code = status;
        let envelope = ErrorInfoMessage::new(status, message, error_code, help_url);
        self.send_json(&envelope).await
    }

    /// Serialize `value` to JSON and send it as `application/json`.
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let json = serde_json::to_vec(value)?;
        self.send_bytes(&json, "application/json").await;
        Ok(())
    }

    /// Send a UTF-8 string with the given MIME type.
    pub async fn send_string(&mut self, data: &str, mime_type: &str) {
        self.send_bytes(data.as_bytes(), mime_type).await;
    }

    /// Send bytes with the given MIME type and a `Content-Length` header.
    ///
    /// For `HEAD` requests the length is announced but no body bytes are written.
    pub async fn send_bytes(&mut self, data: &[u8], mime_type: &str) {
        self.content_type = mime_type.to_string();
        self.send_body(data).await;
    }

    /// Copy `reader` to the client using chunked transfer encoding.
    ///
    /// A read error ends the body early with the terminating chunk. Cancellation of the
    /// connection closes it without the terminating chunk, so the client sees a
    /// truncated body.
    pub async fn send_stream<R>(&mut self, mut reader: R, mime_type: &str)
    where
        R: AsyncRead + Unpin,
    {
        self.content_type = mime_type.to_string();
        let sink = Arc::clone(&self.sink);
        let mut state = sink.state.lock().await;
        if state.writer.is_none() {
            return;
        }

        let block = self.header_block(true, 0);
        state.send_headers(&block, true).await;

        let mut buffer = vec![0u8; self.stream_buffer_size];
        loop {
            let result = tokio::select! {
                _ = self.cancellation.cancelled() => {
                    debug!("Response stream cancelled after {} bytes", self.content_length);
                    state.finish().await;
                    return;
                }
                result = reader.read(&mut buffer) => result,
            };

            let read = match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading response stream: {e}");
                    break;
                }
            };
            self.content_length += read as u64;
            if !self.head_request {
                state.write_chunk(&buffer[..read]).await;
            }
            if state.writer.is_none() {
                return;
            }
        }

        self.finish_chunked(&mut state).await;
    }

    /// Send a file using chunked transfer encoding.
    ///
    /// If the file cannot be opened the response degrades to an empty chunked body.
    pub async fn send_file(&mut self, path: impl AsRef<Path>, mime_type: &str) {
        let path = path.as_ref();
        self.content_type = mime_type.to_string();
        match tokio::fs::File::open(path).await {
            Ok(file) => self.send_stream(file, mime_type).await,
            Err(e) => {
                warn!("Unable to open {path}: {e}", path = path.display());
                self.send_final_chunk(None).await;
            }
        }
    }

    /// Send one chunk, sending chunked headers first if needed. The connection stays
    /// open. Empty chunks are skipped, since a zero-length chunk would end the body.
    pub async fn send_chunk(&mut self, data: &[u8]) {
        let sink = Arc::clone(&self.sink);
        let mut state = sink.state.lock().await;
        if state.writer.is_none() {
            return;
        }

        let block = self.header_block(true, 0);
        state.send_headers(&block, true).await;

        self.content_length += data.len() as u64;
        if !self.head_request {
            state.write_chunk(data).await;
        }
    }

    /// Send an optional last chunk and the terminating chunk, then close the
    /// connection.
    pub async fn send_final_chunk(&mut self, data: Option<&[u8]>) {
        let sink = Arc::clone(&self.sink);
        let mut state = sink.state.lock().await;
        if state.writer.is_none() {
            return;
        }

        let block = self.header_block(true, 0);
        state.send_headers(&block, true).await;

        if let Some(data) = data {
            self.content_length += data.len() as u64;
            if !self.head_request {
                state.write_chunk(data).await;
            }
        }

        self.finish_chunked(&mut state).await;
    }

    /// Best-effort flush and close; errors are ignored.
    pub async fn close(&self) {
        self.sink.close().await;
    }

    async fn send_body(&mut self, data: &[u8]) {
        let sink = Arc::clone(&self.sink);
        let mut state = sink.state.lock().await;
        if state.writer.is_none() {
            return;
        }

        if state.headers_sent && state.chunked {
            // Headers already announced a chunked body
            self.content_length += data.len() as u64;
            if !self.head_request {
                state.write_chunk(data).await;
            }
            self.finish_chunked(&mut state).await;
            return;
        }

        self.content_length = data.len() as u64;
        let block = self.header_block(false, self.content_length);
        state.send_headers(&block, false).await;
        if !self.head_request && !data.is_empty() {
            state.write(data).await;
        }
        state.finish().await;
    }

    async fn finish_chunked(&self, state: &mut SinkState) {
        if !self.head_request {
            state.write(FINAL_CHUNK).await;
        }
        state.finish().await;
    }

    fn header_block(&self, chunked: bool, content_length: u64) -> Vec<u8> {
        let mut block = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status_code.as_u16(),
            self.status_code.reason_phrase()
        );

        block.push_str("Access-Control-Allow-Origin: *\r\n");
        if !self.content_type.is_empty() {
            block.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        }
        block.push_str(&format!("Server: {}\r\n", self.server_name));
        block.push_str("Connection: close\r\n");
        if chunked {
            block.push_str("Transfer-Encoding: chunked\r\n");
        } else {
            block.push_str(&format!("Content-Length: {content_length}\r\n"));
        }

        for (name, value) in &self.headers {
            // Framing headers are owned by the writer
            if name.is_empty()
                || name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Transfer-Encoding")
                || name.eq_ignore_ascii_case("Connection")
                || name.eq_ignore_ascii_case("Access-Control-Allow-Origin")
                || name.eq_ignore_ascii_case("Content-Type")
                || name.eq_ignore_ascii_case("Server")
            {
                continue;
            }
            block.push_str(&format!("{name}: {value}\r\n"));
        }

        block.push_str("\r\n");
        block.into_bytes()
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- HTTP Response ---")?;
        writeln!(f, "  Status Code        : {}", self.status_code)?;
        writeln!(f, "  Content            : {}", self.content_type)?;
        writeln!(f, "  Content Length     : {} bytes", self.content_length)?;
        if self.headers.is_empty() {
            writeln!(f, "  Headers            : none")?;
        } else {
            writeln!(f, "  Headers            :")?;
            for (name, value) in &self.headers {
                writeln!(f, "  - {name}: {value}")?;
            }
        }
        Ok(())
    }
}
