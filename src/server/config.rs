//! Server configuration.

use std::time::Duration;

/// Default block size used when streaming a response body.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 1024 * 1024;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostnames or IP addresses to bind. `*` binds every interface.
    pub hostnames: Vec<String>,
    /// The TCP port, 1-65535.
    pub port: u16,
    /// The maximum number of concurrent connections.
    pub max_connections: usize,
    /// Upper bound on the size of a request head.
    pub max_header_size: usize,
    /// Block size for streamed and file responses.
    pub stream_buffer_size: usize,
    /// Abort handlers that run longer than this.
    pub timeout: Option<Duration>,
    /// How long shutdown waits for in-flight connections.
    pub shutdown_timeout: Duration,
    /// Value of the `Server` response header.
    pub server_name: String,
}

impl ServerConfig {
    /// A configuration for `hostname:port` with every other setting at its default.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostnames: vec![hostname.into()],
            port,
            ..Self::default()
        }
    }

    pub fn with_hostnames(mut self, hostnames: Vec<String>) -> Self {
        self.hostnames = hostnames;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }

    /// The addresses to bind, with `*` and empty names mapped to all interfaces.
    pub fn bind_addresses(&self) -> Vec<String> {
        let hosts: Vec<&str> = self
            .hostnames
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .collect();

        if hosts.is_empty() {
            return vec![format!("0.0.0.0:{}", self.port)];
        }

        hosts
            .into_iter()
            .map(|host| match host {
                "*" | "+" => format!("0.0.0.0:{}", self.port),
                h if h.contains(':') && !h.starts_with('[') => format!("[{h}]:{}", self.port),
                h => format!("{h}:{}", self.port),
            })
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostnames: vec!["127.0.0.1".to_string()],
            port: 8080,
            max_connections: 1024,
            max_header_size: 8192,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            server_name: "embedhttp".to_string(),
        }
    }
}
