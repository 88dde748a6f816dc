//! HTTP request parsing and representation.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::thread::ThreadId;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use url::Url;

use crate::parser::chunk::{Chunk, ChunkReader};
use crate::parser::error::Error;
use crate::parser::method::Verb;
use crate::parser::multipart::{parse_multipart, FormPart};
use crate::parser::path::{
    insert_joined, parse_query_string, path_segments, split_target, url_decode,
};
use crate::parser::version::HttpVersion;

/// The read side of a connection, positioned just after the request head.
pub type BodyReader = BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>;

/// The request line and header fields as they arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// The method token, unvalidated.
    pub method: String,
    /// The request target (origin-form or absolute-form).
    pub target: String,
    /// The protocol version token.
    pub version: String,
    /// Header fields in arrival order.
    pub headers: Vec<(String, String)>,
}

/// Parse a request head (request line plus header fields).
///
/// # Arguments
///
/// * `input` - The bytes up to and including the blank line that ends the head
///
/// # Returns
///
/// The raw request, or an error if the request line or a header line is malformed
pub fn parse_head(input: &[u8]) -> Result<RawRequest, Error> {
    let input = String::from_utf8_lossy(input);
    let mut lines = input.lines().skip_while(|line| line.trim().is_empty());

    let request_line = match lines.next() {
        Some(line) => line.trim().trim_matches('\0'),
        None => return Err(Error::EmptyRequest),
    };

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::MalformedRequest(request_line.to_string()));
    }

    let mut headers = Vec::new();
    for line in lines {
        // Empty line indicates the end of headers
        if line.trim().is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeaderFormat(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(RawRequest {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
    })
}

/// Read a request head from the connection, line by line, up to the blank line.
///
/// Leading blank lines are skipped. Fails with [`Error::HeadersTooLarge`] once more than
/// `max_size` bytes have been read without reaching the end of the head.
pub async fn read_head(reader: &mut BodyReader, max_size: usize) -> Result<Vec<u8>, Error> {
    let mut head = Vec::new();

    loop {
        let start = head.len();
        let remaining = max_size.saturating_add(1).saturating_sub(start) as u64;
        let n = (&mut *reader).take(remaining).read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.iter().all(u8::is_ascii_whitespace) {
                return Err(Error::EmptyRequest);
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of request head",
            )));
        }
        if head.len() > max_size {
            return Err(Error::HeadersTooLarge(max_size));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

enum Body {
    Buffered {
        data: Vec<u8>,
        rest: Option<BodyReader>,
    },
    Chunked(ChunkReader),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Buffered { data, .. } => write!(f, "Buffered({} bytes)", data.len()),
            Body::Chunked(reader) => write!(f, "Chunked(done: {})", reader.is_done()),
        }
    }
}

/// Represents an HTTP request.
///
/// Metadata is fixed at construction. The body is either drained into memory while the
/// request is built, or, for `Transfer-Encoding: chunked`, left on the connection to be
/// pulled with [`HttpRequest::read_chunk`].
#[derive(Debug)]
pub struct HttpRequest {
    /// When the request was captured
    pub timestamp_utc: SystemTime,
    /// The worker thread that parsed the request (informational)
    pub thread_id: ThreadId,
    /// The HTTP version
    pub protocol_version: HttpVersion,
    /// The client address
    pub source: SocketAddr,
    /// The local address that accepted the connection
    pub destination: SocketAddr,
    /// Host parsed from the full URL, if any
    pub dest_hostname: Option<String>,
    /// Port parsed from the full URL, if any
    pub dest_host_port: Option<u16>,
    /// Whether the client asked to keep the connection open
    pub keepalive: bool,
    /// The HTTP verb
    pub verb: Verb,
    /// `Transfer-Encoding` includes `chunked`
    pub chunked_transfer: bool,
    /// `Transfer-Encoding` includes `gzip`
    pub gzip: bool,
    /// `Transfer-Encoding` includes `deflate`
    pub deflate: bool,
    /// The absolute URL of the request
    pub full_url: String,
    /// The request path including the querystring
    pub raw_url_with_query: String,
    /// The request path without the querystring
    pub raw_url_without_query: String,
    /// Non-empty path segments, in order
    pub raw_url_entries: Vec<String>,
    /// Everything after the first `?`
    pub querystring: Option<String>,
    /// Decoded querystring entries; repeated keys are comma-joined
    pub querystring_entries: HashMap<String, Option<String>>,
    /// The User-Agent header
    pub useragent: Option<String>,
    /// The Content-Length header, 0 when absent
    pub content_length: u64,
    /// The Content-Type header
    pub content_type: Option<String>,
    /// Header fields; repeated names are comma-joined
    pub headers: HashMap<String, String>,
    body: Body,
}

impl HttpRequest {
    /// Build a request from a raw head and the connection it arrived on.
    ///
    /// # Arguments
    ///
    /// * `raw` - The parsed request head
    /// * `source` - The client address
    /// * `destination` - The local address
    /// * `reader` - The connection, positioned at the start of the body
    ///
    /// # Returns
    ///
    /// The request, or an error if the verb, version or body is invalid
    pub async fn from_raw(
        raw: RawRequest,
        source: SocketAddr,
        destination: SocketAddr,
        mut reader: BodyReader,
    ) -> Result<Self, Error> {
        let timestamp_utc = SystemTime::now();
        let thread_id = std::thread::current().id();

        let verb = raw.method.parse::<Verb>()?;
        let protocol_version = raw.version.parse::<HttpVersion>()?;

        let mut headers = HashMap::new();
        let mut useragent = None;
        let mut content_type = None;
        let mut content_length = 0;
        let mut chunked_transfer = false;
        let mut gzip = false;
        let mut deflate = false;
        let mut connection = None;

        for (name, value) in &raw.headers {
            insert_joined(&mut headers, name, value);

            match name.to_ascii_lowercase().as_str() {
                "user-agent" => useragent = Some(value.clone()),
                "content-type" => content_type = Some(value.clone()),
                "content-length" => {
                    content_length = value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| Error::InvalidContentLength(value.clone()))?;
                }
                "transfer-encoding" => {
                    let value = value.to_ascii_lowercase();
                    chunked_transfer |= value.contains("chunked");
                    gzip |= value.contains("gzip");
                    deflate |= value.contains("deflate");
                }
                "connection" => connection = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }

        let keepalive = match (&connection, protocol_version) {
            (Some(c), _) if c.contains("close") => false,
            (Some(c), _) if c.contains("keep-alive") => true,
            (_, version) => version == HttpVersion::Http11,
        };

        let target = raw.target.trim();
        let absolute = target.starts_with("http://") || target.starts_with("https://");
        let full_url = if absolute {
            target.to_string()
        } else {
            let host = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("Host"))
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| destination.to_string());
            format!("http://{host}{target}")
        };

        // Best-effort: a URL that does not parse leaves the destination fields unset
        let parsed_url = Url::parse(&full_url).ok();
        let dest_hostname = parsed_url.as_ref().and_then(|u| u.host_str().map(str::to_string));
        let dest_host_port = parsed_url.as_ref().and_then(Url::port_or_known_default);

        let raw_url_with_query = match (&parsed_url, absolute) {
            (Some(url), true) => match url.query() {
                Some(query) => format!("{}?{query}", url.path()),
                None => url.path().to_string(),
            },
            _ => target.to_string(),
        };

        let (path, query) = split_target(&raw_url_with_query);
        let raw_url_without_query = path.to_string();
        let raw_url_entries = path_segments(path);
        let querystring = query.map(str::to_string);
        let querystring_entries = query.map(parse_query_string).unwrap_or_default();

        let body = if chunked_transfer {
            Body::Chunked(ChunkReader::new(reader))
        } else {
            let mut data = Vec::new();
            if content_length > 0 {
                let read = (&mut reader).take(content_length).read_to_end(&mut data).await? as u64;
                if read < content_length {
                    return Err(Error::IncompleteBody {
                        expected: content_length,
                        read,
                    });
                }
            }
            Body::Buffered {
                data,
                rest: Some(reader),
            }
        };

        Ok(Self {
            timestamp_utc,
            thread_id,
            protocol_version,
            source,
            destination,
            dest_hostname,
            dest_host_port,
            keepalive,
            verb,
            chunked_transfer,
            gzip,
            deflate,
            full_url,
            raw_url_with_query,
            raw_url_without_query,
            raw_url_entries,
            querystring,
            querystring_entries,
            useragent,
            content_length,
            content_type,
            headers,
            body,
        })
    }

    /// Get a header value.
    ///
    /// # Arguments
    ///
    /// * `name` - The header name
    ///
    /// # Returns
    ///
    /// The header value, if it exists
    pub fn get_header(&self, name: &str) -> Option<&String> {
        // Headers are case-insensitive, so we need to do a case-insensitive lookup
        self.headers.iter().find_map(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Check if a header exists.
    pub fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }

    /// Get a query parameter value.
    ///
    /// Returns `None` both for missing keys and for keys given without a value.
    pub fn get_query_param(&self, name: &str) -> Option<&str> {
        self.querystring_entries.get(name).and_then(|v| v.as_deref())
    }

    /// Check if a query parameter exists, with or without a value.
    pub fn has_query_param(&self, name: &str) -> bool {
        self.querystring_entries.contains_key(name)
    }

    /// Look a key up in the headers, then in the querystring, ignoring case.
    pub fn retrieve_header_value(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.get_header(key) {
            return Some(value);
        }
        self.querystring_entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Check if the request has a JSON body.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json"))
    }

    /// The buffered body.
    ///
    /// Empty for chunked requests until [`HttpRequest::read_body`] has drained them.
    pub fn body(&self) -> &[u8] {
        match &self.body {
            Body::Buffered { data, .. } => data,
            Body::Chunked(_) => &[],
        }
    }

    /// Read the next chunk of a chunked request.
    pub async fn read_chunk(&mut self) -> Result<Chunk, Error> {
        match &mut self.body {
            Body::Chunked(reader) => reader.read_chunk().await,
            Body::Buffered { .. } => Err(Error::NotChunked),
        }
    }

    /// The whole body, draining any remaining chunks first.
    pub async fn read_body(&mut self) -> Result<&[u8], Error> {
        if let Body::Chunked(reader) = &mut self.body {
            let mut data = Vec::new();
            while !reader.is_done() {
                let chunk = reader.read_chunk().await?;
                if let Some(bytes) = chunk.data {
                    data.extend_from_slice(&bytes);
                }
            }

            let placeholder = Body::Buffered {
                data: Vec::new(),
                rest: None,
            };
            if let Body::Chunked(reader) = std::mem::replace(&mut self.body, placeholder) {
                self.body = Body::Buffered {
                    data,
                    rest: Some(reader.into_inner()),
                };
            }
        }

        Ok(self.body())
    }

    /// The body decoded as UTF-8, lossily.
    pub async fn post_data_as_string(&mut self) -> Result<String, Error> {
        let body = self.read_body().await?;
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    /// Deserialize the body as JSON.
    pub async fn post_data<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let body = self.read_body().await?;
        Ok(serde_json::from_slice(body)?)
    }

    /// All parts of a `multipart/form-data` body.
    pub fn form_parts(&self) -> Vec<FormPart> {
        parse_multipart(self.body(), self.content_type.as_deref())
    }

    /// Only the parts of a `multipart/form-data` body that carry a filename.
    ///
    /// Files are collected in order until their combined size would exceed
    /// `max_total` bytes; the file that crosses the limit and everything after it
    /// are left out. Pass `usize::MAX` for no limit.
    pub fn uploaded_files(&self, max_total: usize) -> Vec<FormPart> {
        let mut total = 0usize;
        self.form_parts()
            .into_iter()
            .filter(|part| part.filename.is_some())
            .take_while(|part| {
                total = total.saturating_add(part.data.len());
                total <= max_total
            })
            .collect()
    }

    /// The querystring as a flat map, last value winning for repeated keys.
    ///
    /// Only `key=value` pairs with both sides non-empty are kept. Keys are lower-cased
    /// when `key_to_lowercase` is set.
    pub fn get_data(&self, key_to_lowercase: bool) -> HashMap<String, String> {
        let mut data = HashMap::new();
        let Some(query) = self.querystring.as_deref() else {
            return data;
        };

        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let entry: Vec<&str> = pair.split('=').filter(|s| !s.is_empty()).collect();
            if entry.len() != 2 {
                continue;
            }

            let mut key = url_decode(entry[0]);
            if key_to_lowercase {
                key = key.to_lowercase();
            }
            data.insert(key, url_decode(entry[1]));
        }

        data
    }

    /// Detach the connection's read side, e.g. for a protocol upgrade.
    ///
    /// Returns `None` for chunked requests whose body has not been fully read, and on
    /// any call after the first.
    pub fn take_stream(&mut self) -> Option<BodyReader> {
        match &mut self.body {
            Body::Buffered { rest, .. } => rest.take(),
            Body::Chunked(_) => None,
        }
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self
            .timestamp_utc
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        writeln!(f, "--- HTTP Request ---")?;
        writeln!(f, "{secs} {} to {}", self.source, self.destination)?;
        writeln!(f, "  {} {} {}", self.verb, self.raw_url_without_query, self.protocol_version)?;
        writeln!(f, "  Full URL    : {}", self.full_url)?;
        writeln!(f, "  Querystring : {}", self.querystring.as_deref().unwrap_or(""))?;
        writeln!(
            f,
            "  Useragent   : {} (Keepalive {})",
            self.useragent.as_deref().unwrap_or(""),
            self.keepalive
        )?;
        writeln!(
            f,
            "  Content     : {} ({} bytes)",
            self.content_type.as_deref().unwrap_or(""),
            self.content_length
        )?;
        if self.headers.is_empty() {
            writeln!(f, "  Headers     : none")?;
        } else {
            writeln!(f, "  Headers     :")?;
            for (name, value) in &self.headers {
                writeln!(f, "    {name}: {value}")?;
            }
        }
        Ok(())
    }
}
