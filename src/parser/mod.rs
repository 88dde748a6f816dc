//! HTTP parser module.
//!
//! This module turns the bytes of a request head into a [`RawRequest`], and a raw
//! request plus its connection into an [`HttpRequest`]. It also holds the path
//! normalization used by route matching.

mod request;
mod method;
mod version;
mod error;
mod chunk;
mod multipart;
mod path;

// Re-export public items
pub use request::{BodyReader, HttpRequest, RawRequest};
pub use method::Verb;
pub use version::HttpVersion;
pub use error::Error;
pub use chunk::{Chunk, ChunkReader};
pub use multipart::FormPart;
pub use path::{normalize, normalize_path};

// Re-export the head parsing functions
pub use request::{parse_head, read_head};
