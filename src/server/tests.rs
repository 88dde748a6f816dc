//! Tests for the HTTP server implementation.

#[cfg(test)]
mod server_tests {
    use std::collections::VecDeque;
    use std::io::{self, Cursor};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::parser::{BodyReader, HttpRequest, Verb};
    use crate::server::{
        Dispatcher, EndpointTable, Error, ErrorInfoMessage, HandlerFn, HttpContext, HttpResponse,
        HttpServer, ResponseSink, ResponseWriter, ServerConfig, StatusCode, WebSocketConnection,
        WebSocketFuture, WebSocketRegistry, WebSocketUpgrader,
    };

    // Mock TcpStream for testing; written bytes stay readable after the stream is moved
    struct MockTcpStream {
        read_data: Cursor<Vec<u8>>,
        write_data: Arc<StdMutex<Vec<u8>>>,
    }

    impl MockTcpStream {
        fn new(read_data: &[u8]) -> (Self, Arc<StdMutex<Vec<u8>>>) {
            let written = Arc::new(StdMutex::new(Vec::new()));
            let stream = Self {
                read_data: Cursor::new(read_data.to_vec()),
                write_data: Arc::clone(&written),
            };
            (stream, written)
        }
    }

    impl AsyncRead for MockTcpStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let n = std::io::Read::read(&mut this.read_data, buf.initialize_unfilled())?;
            buf.advance(n);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockTcpStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.write_data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn text(written: &Arc<StdMutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&written.lock().unwrap()).into_owned()
    }

    fn body_of(response: &str) -> &str {
        response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
    }

    /// A response writing into a buffer.
    fn response(head_request: bool) -> (HttpResponse, Arc<StdMutex<Vec<u8>>>) {
        let (stream, written) = MockTcpStream::new(b"");
        let sink = ResponseSink::new(Box::new(stream));
        (HttpResponse::new(sink, head_request), written)
    }

    async fn not_found(mut ctx: HttpContext) -> Result<(), Error> {
        ctx.response
            .send_message(StatusCode::NOT_FOUND, "Not found")
            .await;
        Ok(())
    }

    async fn hello(mut ctx: HttpContext) -> Result<(), Error> {
        ctx.response.send_string("Hello", "text/plain").await;
        Ok(())
    }

    async fn failing(_ctx: HttpContext) -> Result<(), Error> {
        Err(Error::InternalError("database unavailable".to_string()))
    }

    async fn panicking(_ctx: HttpContext) -> Result<(), Error> {
        panic!("handler bug")
    }

    async fn dispatch(dispatcher: &Dispatcher, request: &[u8]) -> (Result<(), Error>, String) {
        let (stream, written) = MockTcpStream::new(request);
        let result = dispatcher
            .handle_connection(stream, addr(), addr(), CancellationToken::new())
            .await;
        (result, text(&written))
    }

    // ---- Endpoint table ----

    #[test]
    fn test_endpoint_table_add_exists_remove() {
        let table = EndpointTable::new();
        let handler: HandlerFn = Arc::new(hello);

        table.add(Verb::GET, "/Users/", handler.clone()).unwrap();
        assert!(table.exists(Verb::GET, "users").unwrap());
        assert!(!table.exists(Verb::POST, "/users").unwrap());
        assert!(table.match_route(Verb::GET, "/USERS").unwrap().is_some());
        assert!(table.match_route(Verb::GET, "/other").unwrap().is_none());

        // Duplicate add keeps a single entry
        table.add(Verb::GET, "users", handler.clone()).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.remove(Verb::GET, "/users").unwrap());
        assert!(!table.remove(Verb::GET, "/users").unwrap());
        assert!(!table.exists(Verb::GET, "/users").unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_endpoint_table_empty_path() {
        let table = EndpointTable::new();
        assert!(matches!(table.add(Verb::GET, "", Arc::new(hello)), Err(Error::EmptyPath)));
        assert!(matches!(table.exists(Verb::GET, ""), Err(Error::EmptyPath)));
        assert!(matches!(table.remove(Verb::GET, ""), Err(Error::EmptyPath)));
        assert!(matches!(table.match_route(Verb::GET, ""), Err(Error::EmptyPath)));
    }

    #[test]
    fn test_endpoint_snapshot() {
        let table = EndpointTable::new();
        table.add(Verb::GET, "/a", Arc::new(hello)).unwrap();
        table.add(Verb::DELETE, "/B", Arc::new(hello)).unwrap();

        let listed: Vec<String> = table.endpoints().iter().map(|e| e.to_string()).collect();
        assert_eq!(listed, vec!["GET /a/", "DELETE /b/"]);
    }

    // ---- Response writer ----

    #[test]
    fn test_status_code_reason_phrase() {
        assert_eq!(StatusCode::OK.reason_phrase(), "OK");
        assert_eq!(StatusCode::NOT_FOUND.reason_phrase(), "Not Found");
        assert_eq!(StatusCode(599).reason_phrase(), "Unknown");
        assert_eq!(StatusCode::from(503), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR.to_string(), "500 Internal Server Error");
    }

    #[tokio::test]
    async fn test_send_string_headers() {
        let (mut response, written) = response(false);
        response.headers.insert("X-Request-Id".to_string(), "42".to_string());
        response.send_string("Hello", "text/plain").await;

        let output = text(&written);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(output.contains("Content-Type: text/plain\r\n"));
        assert!(output.contains("Server: embedhttp\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(output.contains("Content-Length: 5\r\n"));
        assert!(output.contains("X-Request-Id: 42\r\n"));
        assert_eq!(body_of(&output), "Hello");
        assert_eq!(response.content_length(), 5);
    }

    #[tokio::test]
    async fn test_headers_sent_once() {
        let (mut response, written) = response(false);
        response.send_status(StatusCode::NO_CONTENT).await;
        assert!(response.headers_sent().await);

        response.send_string("ignored", "text/plain").await;
        response.send_chunk(b"ignored").await;
        response.send_final_chunk(None).await;
        response.close().await;

        let output = text(&written);
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
        assert!(output.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!output.contains("ignored"));
    }

    #[tokio::test]
    async fn test_head_request_suppresses_body() {
        let (mut response, written) = response(true);
        response.send_bytes(b"hello", "text/plain").await;

        let output = text(&written);
        assert!(output.contains("Content-Length: 5\r\n"));
        assert!(output.ends_with("\r\n\r\n"));
        assert_eq!(body_of(&output), "");
    }

    #[tokio::test]
    async fn test_chunked_framing() {
        let (mut response, written) = response(false);
        response.send_chunk(b"hello").await;
        response.send_chunk(b"").await;
        response.send_chunk(b" world").await;
        response.send_final_chunk(Some(b"!")).await;

        let output = text(&written);
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
        assert!(output.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!output.contains("Content-Length"));
        assert_eq!(body_of(&output), "5\r\nhello\r\n6\r\n world\r\n1\r\n!\r\n0\r\n\r\n");
        assert_eq!(response.content_length(), 12);
    }

    #[tokio::test]
    async fn test_terminal_send_after_chunks() {
        let (mut response, written) = response(false);
        response.send_chunk(b"abc").await;
        response.send_string("de", "text/plain").await;

        let output = text(&written);
        assert_eq!(body_of(&output), "3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_send_file_in_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"abcdefghij").unwrap();

        let (response, written) = response(false);
        let mut response = response.with_stream_buffer_size(4);
        response.send_file(file.path(), "application/octet-stream").await;

        let output = text(&written);
        assert!(output.contains("Content-Type: application/octet-stream\r\n"));
        assert_eq!(
            body_of(&output),
            "4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"
        );
        assert_eq!(response.content_length(), 10);
    }

    #[tokio::test]
    async fn test_send_missing_file_degrades_to_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut response, written) = response(false);
        response
            .send_file(dir.path().join("missing.bin"), "application/octet-stream")
            .await;

        let output = text(&written);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(body_of(&output), "0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_send_error_envelope() {
        let (mut response, written) = response(false);
        response
            .send_error(StatusCode::NOT_FOUND, "No such user", 1001, "https://example.com/help")
            .await
            .unwrap();

        let output = text(&written);
        assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(output.contains("Content-Type: application/json\r\n"));
        assert_eq!(
            body_of(&output),
            r#"{"httpStatusCode":404,"errorCode":1001,"errorMessage":"No such user","errorHelpUrl":"https://example.com/help"}"#
        );

        let envelope: ErrorInfoMessage = serde_json::from_str(body_of(&output)).unwrap();
        assert_eq!(envelope.http_status_code, 404);
        assert_eq!(envelope.error_code, 1001);
    }

    #[tokio::test]
    async fn test_send_json() {
        #[derive(serde::Serialize)]
        struct User {
            name: &'static str,
            age: u32,
        }

        let (mut response, written) = response(false);
        response.send_json(&User { name: "Jan", age: 42 }).await.unwrap();

        let output = text(&written);
        assert!(output.contains("Content-Type: application/json\r\n"));
        assert!(output.contains("Content-Length: 23\r\n"));
        assert_eq!(body_of(&output), r#"{"name":"Jan","age":42}"#);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut response, written) = response(false);
        response.close().await;
        response.close().await;
        response.send_string("late", "text/plain").await;

        assert!(text(&written).is_empty());
        assert!(!response.sink().is_writable().await);
    }

    #[tokio::test]
    async fn test_send_stream_stops_when_cancelled() {
        let (response, written) = response(false);
        let token = CancellationToken::new();
        let mut response = response.with_cancellation(token.clone());

        // The source never reaches EOF while `source` is alive
        let (mut source, reader) = tokio::io::duplex(64);
        source.write_all(b"abc").await.unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(1),
            response.send_stream(reader, "text/plain"),
        )
        .await
        .expect("stream kept running after cancellation");

        let output = text(&written);
        assert!(output.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(body_of(&output), "3\r\nabc\r\n");
        assert!(!response.sink().is_writable().await);
        drop(source);
    }

    // ---- Dispatcher ----

    #[tokio::test]
    async fn test_route_matches_normalized_path() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), not_found);
        dispatcher
            .endpoints()
            .add(Verb::GET, "/hello/", Arc::new(hello))
            .unwrap();

        let (result, output) =
            dispatch(&dispatcher, b"GET /HELLO HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert!(result.is_ok());
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&output), "Hello");
    }

    #[tokio::test]
    async fn test_query_does_not_affect_routing() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), not_found);
        dispatcher
            .endpoints()
            .add(
                Verb::GET,
                "/search",
                Arc::new(|mut ctx: HttpContext| async move {
                    let q = ctx.request.get_query_param("q").unwrap_or("").to_string();
                    ctx.response.send_string(&q, "text/plain").await;
                    Ok::<(), Error>(())
                }),
            )
            .unwrap();

        let (_, output) =
            dispatch(&dispatcher, b"GET /search?q=rust+lang HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert_eq!(body_of(&output), "rust lang");
    }

    #[tokio::test]
    async fn test_default_handler_fallback() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), not_found);
        dispatcher
            .endpoints()
            .add(Verb::GET, "/hello", Arc::new(hello))
            .unwrap();

        let (result, output) =
            dispatch(&dispatcher, b"POST /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert!(result.is_ok());
        assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(body_of(&output), "Not found");
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_first_handler() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), not_found);
        dispatcher
            .endpoints()
            .add(Verb::GET, "/dup", Arc::new(hello))
            .unwrap();
        dispatcher
            .endpoints()
            .add(
                Verb::GET,
                "/DUP/",
                Arc::new(|mut ctx: HttpContext| async move {
                    ctx.response.send_string("Second", "text/plain").await;
                    Ok::<(), Error>(())
                }),
            )
            .unwrap();

        let (_, output) = dispatch(&dispatcher, b"GET /dup HTTP/1.1\r\n\r\n").await;
        assert_eq!(body_of(&output), "Hello");
        assert_eq!(dispatcher.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_options_preflight_bypasses_table() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let dispatcher = Dispatcher::new(ServerConfig::default(), move |_ctx: HttpContext| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        });

        let (result, output) = dispatch(
            &dispatcher,
            b"OPTIONS /anything HTTP/1.1\r\nAccess-Control-Request-Headers: X-Token\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert!(!called.load(Ordering::SeqCst));
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains(
            "Access-Control-Allow-Methods: GET, POST, PUT, PATCH, DELETE, COPY, HEAD, OPTIONS, \
             LINK, UNLINK, PURGE, LOCK, UNLOCK, PROPFIND, VIEW\r\n"
        ));
        assert!(output.contains("Access-Control-Allow-Headers: X-Token\r\n"));
        assert!(output.contains("Access-Control-Max-Age: 86400\r\n"));
        assert!(output.contains("Access-Control-Allow-Origin: *\r\n"));
    }

    #[tokio::test]
    async fn test_failing_handler_yields_one_500() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), failing);

        let (result, output) = dispatch(&dispatcher, b"GET / HTTP/1.1\r\n\r\n").await;

        assert!(matches!(result, Err(Error::InternalError(_))));
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(output.contains("Content-Length: 0\r\n"));
        assert!(!output.contains("database unavailable"));
    }

    #[tokio::test]
    async fn test_failure_after_send_keeps_response() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), |mut ctx: HttpContext| async move {
            ctx.response.send_string("done", "text/plain").await;
            Err::<(), Error>(Error::InternalError("late failure".to_string()))
        });

        let (result, output) = dispatch(&dispatcher, b"GET / HTTP/1.1\r\n\r\n").await;

        assert!(result.is_err());
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_500() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), panicking);

        let (result, output) = dispatch(&dispatcher, b"GET / HTTP/1.1\r\n\r\n").await;

        assert!(matches!(result, Err(Error::InternalError(_))));
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn test_handler_timeout_yields_500() {
        let config = ServerConfig::default().with_timeout(Duration::from_millis(50));
        let dispatcher = Dispatcher::new(config, |mut ctx: HttpContext| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ctx.response.send_string("too late", "text/plain").await;
            Ok::<(), Error>(())
        });

        let (result, output) = dispatch(&dispatcher, b"GET /slow HTTP/1.1\r\n\r\n").await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!output.contains("too late"));
    }

    #[tokio::test]
    async fn test_invalid_request_yields_400() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);

        let (result, output) = dispatch(&dispatcher, b"INVALID REQUEST\r\n\r\n").await;

        assert!(matches!(result, Err(Error::ParseError(_))));
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Content-Type: text/plain\r\n"));
        assert!(body_of(&output).starts_with("Error parsing request:"));
    }

    #[tokio::test]
    async fn test_unknown_verb_yields_400() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);

        let (result, output) = dispatch(&dispatcher, b"BREW /pot HTTP/1.1\r\n\r\n").await;

        assert!(result.is_err());
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_empty_connection_writes_nothing() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);

        let (result, output) = dispatch(&dispatcher, b"").await;

        assert!(result.is_ok());
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_post_body_reaches_handler() {
        #[derive(serde::Deserialize)]
        struct Greeting {
            name: String,
        }

        let dispatcher = Dispatcher::new(ServerConfig::default(), |mut ctx: HttpContext| async move {
            let greeting: Greeting = ctx.request.post_data().await?;
            ctx.response
                .send_string(&format!("Hi {}", greeting.name), "text/plain")
                .await;
            Ok::<(), Error>(())
        });

        let (result, output) = dispatch(
            &dispatcher,
            b"POST /greet HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 14\r\n\r\n{\"name\":\"Ana\"}",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(body_of(&output), "Hi Ana");
    }

    #[tokio::test]
    async fn test_connection_token_cancelled_after_request() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);
        let token = CancellationToken::new();
        let (stream, _) = MockTcpStream::new(b"GET / HTTP/1.1\r\n\r\n");

        dispatcher
            .handle_connection(stream, addr(), addr(), token.clone())
            .await
            .unwrap();

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_handle_connection_over_duplex() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let (result, raw) = tokio::join!(
            dispatcher.handle_connection(server, addr(), addr(), CancellationToken::new()),
            async {
                let mut raw = Vec::new();
                client.read_to_end(&mut raw).await.unwrap();
                raw
            }
        );

        result.unwrap();
        let output = String::from_utf8_lossy(&raw);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&output), "Hello");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_request_read() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);
        let token = CancellationToken::new();
        let (mut client, server) = tokio::io::duplex(1024);

        // The body stops short of Content-Length and the client stays connected
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc")
            .await
            .unwrap();

        let canceller = token.clone();
        let (result, _) = tokio::join!(
            tokio::time::timeout(
                Duration::from_secs(1),
                dispatcher.handle_connection(server, addr(), addr(), token.clone()),
            ),
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                canceller.cancel();
            }
        );

        let result = result.expect("request read was not interrupted");
        assert!(matches!(result, Err(Error::Cancelled)));

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_context_get_data() {
        async fn echo_data(mut ctx: HttpContext) -> Result<(), Error> {
            let mut pairs: Vec<String> = ctx
                .get_data(true)
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            pairs.sort();
            ctx.response.send_string(&pairs.join(","), "text/plain").await;
            Ok(())
        }

        let dispatcher = Dispatcher::new(ServerConfig::default(), echo_data);

        let (_, output) =
            dispatch(&dispatcher, b"GET /?B=2&a=1&b=3&c=x%20y HTTP/1.1\r\n\r\n").await;

        assert_eq!(body_of(&output), "a=1,b=3,c=x y");
    }

    #[tokio::test]
    async fn test_head_request_through_dispatcher() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), hello);

        let (_, output) = dispatch(&dispatcher, b"HEAD / HTTP/1.1\r\n\r\n").await;

        assert!(output.contains("Content-Length: 5\r\n"));
        assert_eq!(body_of(&output), "");
    }

    // ---- Server ----

    #[tokio::test]
    async fn test_start_rejects_port_zero() {
        let result = HttpServer::start(ServerConfig::new("127.0.0.1", 0), not_found).await;
        assert!(matches!(result, Err(Error::InvalidPort(0))));
    }

    #[test]
    fn test_bind_addresses() {
        let config = ServerConfig::new("*", 9000);
        assert_eq!(config.bind_addresses(), vec!["0.0.0.0:9000"]);

        let config = ServerConfig::default()
            .with_hostnames(vec!["localhost".to_string(), "::1".to_string()]);
        assert_eq!(config.bind_addresses(), vec!["localhost:8080", "[::1]:8080"]);

        let config = ServerConfig::default().with_hostnames(Vec::new());
        assert_eq!(config.bind_addresses(), vec!["0.0.0.0:8080"]);
    }

    #[tokio::test]
    async fn test_server_round_trip_over_tcp() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };

        let server = HttpServer::start(ServerConfig::new("127.0.0.1", port), not_found)
            .await
            .unwrap();
        server.add_endpoint(Verb::GET, "/hello", hello).unwrap();
        assert!(server.is_listening());
        assert_eq!(server.endpoints().len(), 1);

        let mut client = tokio::net::TcpStream::connect(server.local_addrs()[0])
            .await
            .unwrap();
        client
            .write_all(b"GET /Hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let output = String::from_utf8_lossy(&raw);

        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&output), "Hello");

        assert!(server.remove_endpoint(Verb::GET, "/hello").unwrap());
        server.shutdown().await;
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_with_503() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };

        let config = ServerConfig::new("127.0.0.1", port).with_max_connections(0);
        let server = HttpServer::start(config, hello).await.unwrap();

        let mut client = tokio::net::TcpStream::connect(server.local_addrs()[0])
            .await
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let output = String::from_utf8_lossy(&raw);

        assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(output.contains("Server is at capacity"));
        server.shutdown().await;
    }

    // ---- WebSocket ----

    #[derive(Default)]
    struct MockConnection {
        incoming: Mutex<VecDeque<String>>,
        sent: StdMutex<Vec<String>>,
        broken: bool,
        hang: bool,
        closed: AtomicBool,
    }

    impl MockConnection {
        fn with_messages(messages: &[&str]) -> Self {
            Self {
                incoming: Mutex::new(messages.iter().map(|m| m.to_string()).collect()),
                ..Self::default()
            }
        }
    }

    impl WebSocketConnection for MockConnection {
        fn send_text<'a>(&'a self, text: &'a str) -> WebSocketFuture<'a, ()> {
            Box::pin(async move {
                if self.broken {
                    return Err(Error::WebSocket("connection reset".to_string()));
                }
                self.sent.lock().unwrap().push(text.to_string());
                Ok(())
            })
        }

        fn receive_text(&self) -> WebSocketFuture<'_, Option<String>> {
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                Ok(self.incoming.lock().await.pop_front())
            })
        }

        fn close(&self) -> WebSocketFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_registry_send_to() {
        let registry = WebSocketRegistry::new();
        let connection = Arc::new(MockConnection::default());
        let id = registry.register(connection.clone());

        assert!(registry.contains(id));
        assert!(registry.send_to(id, "ping").await.unwrap());
        assert_eq!(*connection.sent.lock().unwrap(), vec!["ping"]);

        assert!(registry.remove(id).is_some());
        assert!(!registry.send_to(id, "ping").await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_send_to_all_drops_broken() {
        let registry = WebSocketRegistry::new();
        let healthy = Arc::new(MockConnection::default());
        let broken = Arc::new(MockConnection {
            broken: true,
            ..MockConnection::default()
        });
        let healthy_id = registry.register(healthy.clone());
        let broken_id = registry.register(broken);

        assert_eq!(registry.send_to_all("news").await, 1);
        assert!(registry.contains(healthy_id));
        assert!(!registry.contains(broken_id));
        assert_eq!(registry.len(), 1);
        assert_eq!(*healthy.sent.lock().unwrap(), vec!["news"]);
    }

    #[tokio::test]
    async fn test_receive_until_close() {
        let registry = WebSocketRegistry::new();
        let connection = Arc::new(MockConnection::with_messages(&["one", "two"]));
        let id = registry.register(connection.clone());

        let mut received = Vec::new();
        registry
            .receive_until_close(id, CancellationToken::new(), |from, text| {
                assert_eq!(from, id);
                received.push(text);
            })
            .await
            .unwrap();

        assert_eq!(received, vec!["one", "two"]);
        assert!(connection.closed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_receive_until_close_honours_cancellation() {
        let registry = Arc::new(WebSocketRegistry::new());
        let connection = Arc::new(MockConnection {
            hang: true,
            ..MockConnection::default()
        });
        let id = registry.register(connection.clone());
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let registry = Arc::clone(&registry);
            let token = token.clone();
            async move { registry.receive_until_close(id, token, |_, _| {}).await }
        });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(connection.closed.load(Ordering::SeqCst));
        assert!(!registry.contains(id));
    }

    struct MockUpgrader {
        count: AtomicUsize,
    }

    impl WebSocketUpgrader for MockUpgrader {
        fn is_upgrade_request(&self, request: &HttpRequest) -> bool {
            request
                .get_header("Upgrade")
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        }

        fn accept<'a>(
            &'a self,
            _request: &'a HttpRequest,
            _reader: BodyReader,
            mut writer: ResponseWriter,
        ) -> WebSocketFuture<'a, Arc<dyn WebSocketConnection>> {
            Box::pin(async move {
                self.count.fetch_add(1, Ordering::SeqCst);
                writer
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                    .await?;
                let connection: Arc<dyn WebSocketConnection> = Arc::new(MockConnection::default());
                Ok(connection)
            })
        }
    }

    async fn upgrade(mut ctx: HttpContext) -> Result<(), Error> {
        if !ctx.is_websocket_request() {
            return not_found(ctx).await;
        }
        let (id, _connection) = ctx.accept_websocket().await?;
        assert!(ctx.websockets().contains(id));
        // The HTTP response is detached now
        ctx.response.send_string("unreachable", "text/plain").await;
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_websocket() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), upgrade);
        let upgrader = Arc::new(MockUpgrader {
            count: AtomicUsize::new(0),
        });
        dispatcher.set_websocket_upgrader(upgrader.clone());

        let (result, output) = dispatch(
            &dispatcher,
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(upgrader.count.load(Ordering::SeqCst), 1);
        assert_eq!(output, "HTTP/1.1 101 Switching Protocols\r\n\r\n");
        assert_eq!(dispatcher.websockets().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_websocket_without_upgrader() {
        let dispatcher = Dispatcher::new(ServerConfig::default(), |mut ctx: HttpContext| async move {
            let err = ctx.accept_websocket().await.err();
            assert!(matches!(err, Some(Error::WebSocket(_))));
            ctx.response.send_status(StatusCode::BAD_REQUEST).await;
            Ok::<(), Error>(())
        });

        let (_, output) = dispatch(
            &dispatcher,
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n",
        )
        .await;

        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
