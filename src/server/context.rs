//! Per-request context handed to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::parser::HttpRequest;
use crate::server::error::Error;
use crate::server::response::HttpResponse;
use crate::server::websocket::{WebSocketConnection, WebSocketRegistry, WebSocketUpgrader};

/// A request, its response, and the connection's cancellation token.
pub struct HttpContext {
    /// The parsed request.
    pub request: HttpRequest,
    /// The response for this request.
    pub response: HttpResponse,
    token: CancellationToken,
    upgrader: Option<Arc<dyn WebSocketUpgrader>>,
    websockets: Arc<WebSocketRegistry>,
}

impl HttpContext {
    pub fn new(request: HttpRequest, response: HttpResponse, token: CancellationToken) -> Self {
        Self {
            request,
            response,
            token,
            upgrader: None,
            websockets: Arc::new(WebSocketRegistry::new()),
        }
    }

    pub(crate) fn with_websockets(
        mut self,
        upgrader: Option<Arc<dyn WebSocketUpgrader>>,
        registry: Arc<WebSocketRegistry>,
    ) -> Self {
        self.upgrader = upgrader;
        self.websockets = registry;
        self
    }

    /// The request's querystring as a flat map. See [`HttpRequest::get_data`].
    pub fn get_data(&self, key_to_lowercase: bool) -> HashMap<String, String> {
        self.request.get_data(key_to_lowercase)
    }

    /// Cancelled when the connection closes or the server shuts down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The server's WebSocket registry.
    pub fn websockets(&self) -> &Arc<WebSocketRegistry> {
        &self.websockets
    }

    /// Whether the request asks for a WebSocket upgrade the server can accept.
    pub fn is_websocket_request(&self) -> bool {
        self.upgrader
            .as_ref()
            .is_some_and(|upgrader| upgrader.is_upgrade_request(&self.request))
    }

    /// Hand the connection to the WebSocket upgrader and register the result.
    ///
    /// Afterwards the HTTP response is detached: every `send*` on it is a no-op.
    pub async fn accept_websocket(
        &mut self,
    ) -> Result<(Ulid, Arc<dyn WebSocketConnection>), Error> {
        let upgrader = self
            .upgrader
            .clone()
            .ok_or_else(|| Error::WebSocket("no WebSocket upgrader configured".to_string()))?;

        if !upgrader.is_upgrade_request(&self.request) {
            return Err(Error::WebSocket("not a WebSocket upgrade request".to_string()));
        }

        let reader = self
            .request
            .take_stream()
            .ok_or_else(|| Error::WebSocket("connection already detached".to_string()))?;
        let writer = self
            .response
            .sink()
            .take_writer()
            .await
            .ok_or_else(|| Error::WebSocket("response already sent".to_string()))?;

        let connection = upgrader.accept(&self.request, reader, writer).await?;
        let id = self.websockets.register(Arc::clone(&connection));
        debug!("Upgraded {source} to WebSocket {id}", source = self.request.source);
        Ok((id, connection))
    }
}
