//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::parser::{self, parse_head, read_head, BodyReader, HttpRequest, Verb};
use crate::server::config::ServerConfig;
use crate::server::context::HttpContext;
use crate::server::endpoint::{Endpoint, EndpointTable};
use crate::server::error::Error;
use crate::server::handler::{Handler, HandlerFn};
use crate::server::response::{HttpResponse, ResponseSink, StatusCode};
use crate::server::websocket::{WebSocketRegistry, WebSocketUpgrader};

/// Value of `Access-Control-Max-Age` on preflight responses, in seconds.
const PREFLIGHT_MAX_AGE: &str = "86400";

/// Routes connections to handlers.
///
/// One dispatcher is shared by every listener of an [`HttpServer`]. It can also be
/// driven directly with any byte stream through [`Dispatcher::handle_connection`].
pub struct Dispatcher {
    config: ServerConfig,
    endpoints: Arc<EndpointTable>,
    default_handler: HandlerFn,
    websockets: Arc<WebSocketRegistry>,
    upgrader: RwLock<Option<Arc<dyn WebSocketUpgrader>>>,
}

impl Dispatcher {
    /// Create a dispatcher answering unmatched requests with `default_handler`.
    pub fn new(config: ServerConfig, default_handler: impl Handler) -> Self {
        Self {
            config,
            endpoints: Arc::new(EndpointTable::new()),
            default_handler: Arc::new(default_handler),
            websockets: Arc::new(WebSocketRegistry::new()),
            upgrader: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Arc<EndpointTable> {
        &self.endpoints
    }

    pub fn websockets(&self) -> &Arc<WebSocketRegistry> {
        &self.websockets
    }

    /// Install the collaborator that performs WebSocket handshakes.
    pub fn set_websocket_upgrader(&self, upgrader: Arc<dyn WebSocketUpgrader>) {
        let mut slot = self.upgrader.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(upgrader);
    }

    fn websocket_upgrader(&self) -> Option<Arc<dyn WebSocketUpgrader>> {
        self.upgrader
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Handle a single connection: parse one request, answer it, close.
    ///
    /// Parse failures are answered with `400`. A handler that fails, panics or runs
    /// past the configured timeout gets a `500` if it had not sent headers yet. The
    /// response is always closed and `token` is always cancelled before returning.
    ///
    /// Cancelling `token` while the request is still being read ends the connection
    /// without a response; during a streamed response it ends the stream early.
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        source: SocketAddr,
        destination: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: Box<dyn AsyncRead + Send + Sync + Unpin> = Box::new(read_half);
        let reader: BodyReader = BufReader::new(read_half);
        let sink = ResponseSink::new(Box::new(write_half));

        let result = self
            .dispatch(reader, Arc::clone(&sink), source, destination, token.clone())
            .await;

        sink.close().await;
        token.cancel();
        result
    }

    async fn dispatch(
        &self,
        reader: BodyReader,
        sink: Arc<ResponseSink>,
        source: SocketAddr,
        destination: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let read = tokio::select! {
            _ = token.cancelled() => {
                debug!("Connection from {source} cancelled while reading the request");
                return Err(Error::Cancelled);
            }
            read = self.read_request(reader, source, destination) => read,
        };

        let request = match read {
            Ok(request) => request,
            Err(parser::Error::EmptyRequest) => {
                debug!("Connection from {source} closed without a request");
                return Ok(());
            }
            Err(e) => {
                let mut response = self.response(Arc::clone(&sink), false);
                response
                    .send_message(StatusCode::BAD_REQUEST, &format!("Error parsing request: {e}"))
                    .await;
                return Err(Error::ParseError(e));
            }
        };

        debug!(
            "{verb} {path} from {source}",
            verb = request.verb,
            path = request.raw_url_without_query
        );

        let response = self
            .response(Arc::clone(&sink), request.verb == Verb::HEAD)
            .with_cancellation(token.clone());

        if request.verb == Verb::OPTIONS {
            Self::send_preflight(&request, response).await;
            return Ok(());
        }

        let handler = match self
            .endpoints
            .match_route(request.verb, &request.raw_url_without_query)
        {
            Ok(Some(handler)) => handler,
            _ => Arc::clone(&self.default_handler),
        };

        let ctx = HttpContext::new(request, response, token)
            .with_websockets(self.websocket_upgrader(), Arc::clone(&self.websockets));

        let outcome = self.run_handler(handler, ctx).await;
        if outcome.is_err() && !sink.headers_sent().await {
            let mut response = self.response(sink, false);
            response.send_status(StatusCode::INTERNAL_SERVER_ERROR).await;
        }
        outcome
    }

    async fn read_request(
        &self,
        mut reader: BodyReader,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<HttpRequest, parser::Error> {
        let head = read_head(&mut reader, self.config.max_header_size).await?;
        let raw = parse_head(&head)?;
        HttpRequest::from_raw(raw, source, destination, reader).await
    }

    /// Run the handler on its own task, bounded by the configured timeout.
    async fn run_handler(&self, handler: HandlerFn, ctx: HttpContext) -> Result<(), Error> {
        let mut task = tokio::spawn(async move { handler.call(ctx).await });

        let joined = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(Error::Timeout(limit));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::InternalError("handler panicked".to_string())),
            Err(e) => Err(Error::InternalError(format!("handler task failed: {e}"))),
        }
    }

    /// Answer a CORS preflight without consulting the endpoint table.
    async fn send_preflight(request: &HttpRequest, mut response: HttpResponse) {
        let methods = Verb::ALL
            .iter()
            .map(Verb::as_str)
            .collect::<Vec<&str>>()
            .join(", ");

        response
            .headers
            .insert("Access-Control-Allow-Methods".to_string(), methods);
        if let Some(requested) = request.get_header("Access-Control-Request-Headers") {
            response
                .headers
                .insert("Access-Control-Allow-Headers".to_string(), requested.clone());
        }
        response
            .headers
            .insert("Access-Control-Max-Age".to_string(), PREFLIGHT_MAX_AGE.to_string());

        response.send_status(StatusCode::OK).await;
    }

    fn response(&self, sink: Arc<ResponseSink>, head_request: bool) -> HttpResponse {
        HttpResponse::new(sink, head_request)
            .with_server_name(self.config.server_name.clone())
            .with_stream_buffer_size(self.config.stream_buffer_size)
    }
}

/// An HTTP server.
///
/// The server starts accepting as soon as [`HttpServer::start`] returns and stops
/// when cancelled, shut down, or dropped.
pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    local_addrs: Vec<SocketAddr>,
    accept_tasks: Mutex<JoinSet<()>>,
}

impl HttpServer {
    /// Bind every configured hostname and start accepting connections.
    ///
    /// # Arguments
    ///
    /// * `config` - The server configuration
    /// * `default_handler` - Answers requests that match no endpoint
    ///
    /// # Returns
    ///
    /// The running server, or an error if the port is 0 or a bind fails
    pub async fn start(config: ServerConfig, default_handler: impl Handler) -> Result<Self, Error> {
        if config.port == 0 {
            return Err(Error::InvalidPort(config.port));
        }

        let mut listeners = Vec::new();
        for addr in config.bind_addresses() {
            let listener = TcpListener::bind(&addr).await?;
            info!("Server listening on http://{addr}");
            listeners.push(listener);
        }

        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let dispatcher = Arc::new(Dispatcher::new(config, default_handler));
        let token = CancellationToken::new();

        let mut local_addrs = Vec::new();
        let mut accept_tasks = JoinSet::new();
        for listener in listeners {
            let local_addr = listener.local_addr()?;
            local_addrs.push(local_addr);
            accept_tasks.spawn(Self::accept_loop(
                listener,
                local_addr,
                Arc::clone(&dispatcher),
                Arc::clone(&semaphore),
                token.clone(),
            ));
        }

        Ok(Self {
            dispatcher,
            token,
            local_addrs,
            accept_tasks: Mutex::new(accept_tasks),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        self.dispatcher.config()
    }

    /// Register `handler` for `(verb, path)`. An existing registration is kept.
    pub fn add_endpoint(&self, verb: Verb, path: &str, handler: impl Handler) -> Result<(), Error> {
        self.dispatcher.endpoints().add(verb, path, Arc::new(handler))?;
        info!("Endpoint added: {verb} {path}");
        Ok(())
    }

    pub fn remove_endpoint(&self, verb: Verb, path: &str) -> Result<bool, Error> {
        let removed = self.dispatcher.endpoints().remove(verb, path)?;
        if removed {
            info!("Endpoint removed: {verb} {path}");
        }
        Ok(removed)
    }

    pub fn endpoint_exists(&self, verb: Verb, path: &str) -> Result<bool, Error> {
        self.dispatcher.endpoints().exists(verb, path)
    }

    /// A snapshot of the registered endpoints.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.dispatcher.endpoints().endpoints()
    }

    /// The addresses actually bound.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn is_listening(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Install the collaborator that performs WebSocket handshakes.
    pub fn set_websocket_upgrader(&self, upgrader: Arc<dyn WebSocketUpgrader>) {
        self.dispatcher.set_websocket_upgrader(upgrader);
    }

    pub fn websockets(&self) -> &Arc<WebSocketRegistry> {
        self.dispatcher.websockets()
    }

    /// Send a text message to one WebSocket connection.
    pub async fn send_to(&self, id: Ulid, text: &str) -> Result<bool, Error> {
        self.dispatcher.websockets().send_to(id, text).await
    }

    /// Send a text message to every WebSocket connection.
    pub async fn send_to_all(&self, text: &str) -> usize {
        self.dispatcher.websockets().send_to_all(text).await
    }

    /// Stop accepting connections. In-flight connections see their tokens cancelled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stop accepting and wait for in-flight connections to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down server...");
        self.token.cancel();

        let mut tasks = self.accept_tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Accept task failed during shutdown: {e}");
            }
        }

        info!("Server shutdown complete");
    }

    async fn accept_loop(
        listener: TcpListener,
        local_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        semaphore: Arc<Semaphore>,
        token: CancellationToken,
    ) {
        // Use JoinSet to keep track of all spawned connection tasks
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Listener {local_addr} stopping");
                    break;
                }

                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!("Connection task failed: {e}");
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((socket, addr)) => {
                            Self::handle_new_connection(
                                socket,
                                addr,
                                local_addr,
                                Arc::clone(&dispatcher),
                                Arc::clone(&semaphore),
                                token.child_token(),
                                &mut tasks,
                            )
                            .await;
                        }
                        Err(e) => Self::handle_accept_error(e).await,
                    }
                }
            }
        }

        drop(listener);
        Self::perform_shutdown(&mut tasks, &dispatcher.config).await;
    }

    async fn handle_new_connection(
        socket: TcpStream,
        addr: SocketAddr,
        local_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        semaphore: Arc<Semaphore>,
        token: CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        // Try to acquire a permit from the semaphore
        let permit = match semaphore.try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {addr}");
                let mut response = dispatcher.response(ResponseSink::new(Box::new(socket)), false);
                response
                    .send_message(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Server is at capacity, please try again later",
                    )
                    .await;
                return;
            }
        };

        let destination = socket.local_addr().unwrap_or(local_addr);

        tasks.spawn(async move {
            // The permit is dropped when the task completes, releasing the semaphore slot
            let _permit = permit;

            match dispatcher
                .handle_connection(socket, addr, destination, token)
                .await
            {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(e) => error!("Error handling connection from {addr}: {e}"),
            }
        });
    }

    async fn handle_accept_error(e: std::io::Error) {
        error!("Error accepting connection: {e}");
        // Back off briefly so a persistent error does not spin the loop
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    async fn perform_shutdown(tasks: &mut JoinSet<()>, config: &ServerConfig) {
        if tasks.is_empty() {
            return;
        }

        info!("Waiting for {len} active connections to complete...", len = tasks.len());
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, aborting {len} connections", len = tasks.len());
            tasks.abort_all();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
