//! HTTP server implementation for embedhttp.
//!
//! This module provides the endpoint table, the response writer, the per-connection
//! dispatcher and the server that owns the listeners.

mod response;
mod config;
mod context;
mod endpoint;
mod error;
mod handler;
mod http_server;
mod websocket;
mod tests;

// Re-export public items
pub use response::{ErrorInfoMessage, HttpResponse, ResponseSink, ResponseWriter, StatusCode};
pub use config::{ServerConfig, DEFAULT_STREAM_BUFFER_SIZE};
pub use context::HttpContext;
pub use endpoint::{Endpoint, EndpointTable};
pub use error::Error;
pub use handler::{Handler, HandlerFn, HandlerFuture};
pub use http_server::{Dispatcher, HttpServer};
pub use websocket::{WebSocketConnection, WebSocketFuture, WebSocketRegistry, WebSocketUpgrader};
