//! WebSocket support.
//!
//! The server does not speak the WebSocket protocol itself. A [`WebSocketUpgrader`]
//! performs the handshake on a detached connection and hands back a
//! [`WebSocketConnection`]; the [`WebSocketRegistry`] keeps accepted connections so
//! they can be addressed later by id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::parser::{BodyReader, HttpRequest};
use crate::server::error::Error;
use crate::server::response::ResponseWriter;

/// Type alias for the boxed futures returned by the WebSocket traits.
pub type WebSocketFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// An accepted WebSocket connection.
pub trait WebSocketConnection: Send + Sync {
    /// Send a text message.
    fn send_text<'a>(&'a self, text: &'a str) -> WebSocketFuture<'a, ()>;

    /// Wait for the next text message. `None` means the peer closed the connection.
    fn receive_text(&self) -> WebSocketFuture<'_, Option<String>>;

    /// Close the connection.
    fn close(&self) -> WebSocketFuture<'_, ()>;
}

/// Performs the WebSocket handshake.
pub trait WebSocketUpgrader: Send + Sync {
    /// Whether `request` asks for a protocol upgrade.
    fn is_upgrade_request(&self, request: &HttpRequest) -> bool;

    /// Complete the handshake over the detached connection.
    fn accept<'a>(
        &'a self,
        request: &'a HttpRequest,
        reader: BodyReader,
        writer: ResponseWriter,
    ) -> WebSocketFuture<'a, Arc<dyn WebSocketConnection>>;
}

/// Accepted WebSocket connections, keyed by a ULID assigned at registration.
#[derive(Default)]
pub struct WebSocketRegistry {
    connections: Mutex<HashMap<Ulid, Arc<dyn WebSocketConnection>>>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `connection` and return its id.
    pub fn register(&self, connection: Arc<dyn WebSocketConnection>) -> Ulid {
        let id = Ulid::new();
        self.lock().insert(id, connection);
        debug!("WebSocket connection {id} registered");
        id
    }

    /// Stop tracking a connection. It is not closed.
    pub fn remove(&self, id: Ulid) -> Option<Arc<dyn WebSocketConnection>> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: Ulid) -> Option<Arc<dyn WebSocketConnection>> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.lock().contains_key(&id)
    }

    /// Ids of all tracked connections.
    pub fn ids(&self) -> Vec<Ulid> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `text` to one connection.
    ///
    /// Returns `Ok(false)` for an unknown id. A connection that fails to send is
    /// dropped from the registry.
    pub async fn send_to(&self, id: Ulid, text: &str) -> Result<bool, Error> {
        let Some(connection) = self.get(id) else {
            return Ok(false);
        };

        if let Err(e) = connection.send_text(text).await {
            warn!("Dropping WebSocket connection {id}: {e}");
            self.remove(id);
            return Err(e);
        }
        Ok(true)
    }

    /// Send `text` to every connection and return how many received it.
    pub async fn send_to_all(&self, text: &str) -> usize {
        let connections: Vec<(Ulid, Arc<dyn WebSocketConnection>)> = self
            .lock()
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect();

        let mut delivered = 0;
        for (id, connection) in connections {
            match connection.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Dropping WebSocket connection {id}: {e}");
                    self.remove(id);
                }
            }
        }
        delivered
    }

    /// Feed incoming messages of connection `id` to `on_message` until the peer
    /// closes, a receive fails, or `token` is cancelled. The connection is then
    /// removed and closed.
    pub async fn receive_until_close<F>(
        &self,
        id: Ulid,
        token: CancellationToken,
        mut on_message: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Ulid, String) + Send,
    {
        let connection = self
            .get(id)
            .ok_or_else(|| Error::WebSocket(format!("unknown connection {id}")))?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("WebSocket connection {id} cancelled");
                    break;
                }
                message = connection.receive_text() => match message {
                    Ok(Some(text)) => on_message(id, text),
                    Ok(None) => {
                        debug!("WebSocket connection {id} closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!("WebSocket connection {id} receive failed: {e}");
                        break;
                    }
                }
            }
        }

        self.remove(id);
        if let Err(e) = connection.close().await {
            debug!("Error closing WebSocket connection {id}: {e}");
        }
        info!("WebSocket connection {id} finished");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ulid, Arc<dyn WebSocketConnection>>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
