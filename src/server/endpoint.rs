//! The endpoint table.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::parser::{normalize_path, Verb};
use crate::server::error::Error;
use crate::server::handler::HandlerFn;

/// A registered route: a verb, a normalized path and the handler answering it.
#[derive(Clone)]
pub struct Endpoint {
    /// The HTTP verb to match.
    pub verb: Verb,
    /// The normalized path to match.
    pub path: String,
    /// The handler function.
    pub handler: HandlerFn,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("verb", &self.verb)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.path)
    }
}

/// Registered endpoints, matched by exact `(verb, normalized path)`.
///
/// Every operation takes the one lock. Paths are normalized on the way in, so
/// `GET /Hello` and `GET hello/` refer to the same entry.
#[derive(Default)]
pub struct EndpointTable {
    endpoints: Mutex<Vec<Endpoint>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `(verb, path)`. Adding an existing pair is a no-op and
    /// the first handler stays in place.
    pub fn add(&self, verb: Verb, path: &str, handler: HandlerFn) -> Result<(), Error> {
        let path = Self::key(path)?;
        let mut endpoints = self.lock();
        if endpoints.iter().any(|e| e.verb == verb && e.path == path) {
            return Ok(());
        }
        endpoints.push(Endpoint { verb, path, handler });
        Ok(())
    }

    /// Remove the endpoint for `(verb, path)`, returning whether one was registered.
    pub fn remove(&self, verb: Verb, path: &str) -> Result<bool, Error> {
        let path = Self::key(path)?;
        let mut endpoints = self.lock();
        let before = endpoints.len();
        endpoints.retain(|e| !(e.verb == verb && e.path == path));
        Ok(endpoints.len() != before)
    }

    pub fn exists(&self, verb: Verb, path: &str) -> Result<bool, Error> {
        Ok(self.get(verb, path)?.is_some())
    }

    pub fn get(&self, verb: Verb, path: &str) -> Result<Option<Endpoint>, Error> {
        let path = Self::key(path)?;
        Ok(self
            .lock()
            .iter()
            .find(|e| e.verb == verb && e.path == path)
            .cloned())
    }

    /// Find the handler registered for `(verb, path)`.
    pub fn match_route(&self, verb: Verb, path: &str) -> Result<Option<HandlerFn>, Error> {
        Ok(self.get(verb, path)?.map(|e| e.handler))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A snapshot of the registered endpoints, in registration order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    fn key(path: &str) -> Result<String, Error> {
        if path.is_empty() {
            return Err(Error::EmptyPath);
        }
        Ok(normalize_path(path))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        // A panicking handler never holds this lock, so the data is still consistent
        self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
