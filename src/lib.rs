//! A minimal embeddable HTTP server.
//!
//! This library provides an HTTP/1.x server meant to be embedded in a larger
//! application: exact-match routing on `(verb, path)`, a response writer that
//! guarantees headers go out once, chunked transfer encoding in both directions, and
//! a hook for handing connections to a WebSocket implementation.
//!
//! # Features
//!
//! - Path normalization: `GET /Hello` and `GET hello/` address the same endpoint
//! - A default handler for every request that matches no endpoint
//! - Automatic CORS preflight answers for `OPTIONS`
//! - Buffered, streamed, file and chunked responses
//! - Structured JSON error bodies
//! - Handler timeouts, connection limits and graceful shutdown
//!
//! # Examples
//!
//! ## Running a server
//!
//! ```no_run
//! use embedhttp::{HttpContext, HttpServer, ServerConfig, ServerError, StatusCode, Verb};
//!
//! async fn not_found(mut ctx: HttpContext) -> Result<(), ServerError> {
//!     ctx.response
//!         .send_error(StatusCode::NOT_FOUND, "No such endpoint", 404, "")
//!         .await
//! }
//!
//! async fn hello(mut ctx: HttpContext) -> Result<(), ServerError> {
//!     let name = ctx.request.get_query_param("name").unwrap_or("World").to_string();
//!     ctx.response
//!         .send_string(&format!("Hello, {name}!"), "text/plain")
//!         .await;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     let server = HttpServer::start(ServerConfig::new("127.0.0.1", 8080), not_found).await?;
//!     server.add_endpoint(Verb::GET, "/hello", hello)?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Path normalization
//!
//! ```
//! use embedhttp::{normalize, Verb};
//!
//! let (verb, path) = normalize("get", " Api/Users ").unwrap();
//! assert_eq!(verb, Verb::GET);
//! assert_eq!(path, "/api/users/");
//! ```
//!
//! ## Error handling
//!
//! ```
//! use embedhttp::{normalize, ParserError};
//!
//! match normalize("BREW", "/pot") {
//!     Err(ParserError::InvalidVerb(verb)) => println!("Invalid verb: {}", verb),
//!     Err(err) => println!("Other error: {}", err),
//!     Ok(_) => println!("Normalized"),
//! }
//! ```
//!
//! See the `demos` directory for a more complete server.

// Export the parser module
pub mod parser;

// Export the server module
pub mod server;

// Re-export commonly used items for convenience
pub use parser::{
    normalize, normalize_path, Chunk, Error as ParserError, HttpRequest, HttpVersion, Verb,
};
pub use server::{
    Error as ServerError, ErrorInfoMessage, HttpContext, HttpResponse, HttpServer, ServerConfig,
    StatusCode, WebSocketConnection, WebSocketRegistry, WebSocketUpgrader,
};
