//! Adapter tests: the synchronous environ/response surface and the
//! event-driven scope/receive/send surface, both over one gateway.

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use gantry_gateway::{EmptyResponseHandler, Gateway};
    use gantry_protocol::{Body, Message, close_code};
    use gantry_transport::{
        AsyncGateway, EventSink, EventSource, Environ, ReceiveEvent, Scope, SendEvent,
        SyncGateway, TransportError,
    };
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Counts gateway invocations.
    type Calls = Arc<AtomicUsize>;

    fn gateway(calls: Calls) -> Arc<Gateway> {
        let gateway = Gateway::builder()
            .request_fn(move |chain, context, response| {
                calls.fetch_add(1, Ordering::SeqCst);
                let request = context.request();

                match request.path() {
                    "/tags" => {
                        let tags: Vec<&str> = request
                            .headers()
                            .get_all("x-tag")
                            .iter()
                            .filter_map(|v| v.to_str().ok())
                            .collect();
                        let summary = format!(
                            "{} {} {} {}",
                            request.method(),
                            request.query().unwrap_or("-"),
                            request.scheme(),
                            tags.join(",")
                        );
                        chain.respond(response, StatusCode::OK, summary);
                    }
                    "/echo" => {
                        let body = request.body().clone();
                        response.insert_header(
                            http::header::CONTENT_TYPE,
                            HeaderValue::from_static("application/octet-stream"),
                        );
                        chain.respond(response, StatusCode::CREATED, body);
                    }
                    "/stream" => {
                        let chunks = ["one", "", "two"].map(Bytes::from);
                        chain.respond(response, StatusCode::OK, Body::stream(chunks));
                    }
                    "/ws" => {
                        let Some(upgrade) = request.upgrade() else {
                            return Ok(());
                        };
                        let socket = upgrade.accept_with(Some("chat"), HeaderMap::new())?;
                        for message in &socket {
                            socket.send(message?)?;
                        }
                        chain.stop();
                    }
                    "/ws-deny" => {
                        response.set_status(StatusCode::UNAUTHORIZED);
                        response.set_text("login first");
                        chain.stop();
                    }
                    _ => {}
                }
                Ok(())
            })
            .response_handler(EmptyResponseHandler::default())
            .build();
        Arc::new(gateway)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync adapter
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn sync_call_keeps_repeated_headers_and_request_fields() {
        let adapter = SyncGateway::new(gateway(Calls::default()));

        let response = adapter
            .call(
                Environ::new("GET", "/tags")
                    .with_query("page=2")
                    .with_header("X-Tag", "a")
                    .with_header("Content-Length", "0")
                    .with_header("x-tag", "b"),
            )
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.into_bytes()[..], b"GET page=2 http a,b");
    }

    #[test]
    fn sync_call_reads_the_body_and_returns_headers() {
        let adapter = SyncGateway::new(gateway(Calls::default()));

        let response = adapter
            .call(Environ::new("POST", "/echo").with_body(Cursor::new(b"payload".to_vec())))
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(&response.into_bytes()[..], b"payload");
    }

    #[test]
    fn sync_streaming_body_skips_empty_chunks() {
        let adapter = SyncGateway::new(gateway(Calls::default()));

        let response = adapter.call(Environ::new("GET", "/stream")).unwrap();
        let chunks: Vec<Bytes> = response.into_body().collect();

        assert_eq!(chunks, vec![Bytes::from("one"), Bytes::from("two")]);
    }

    #[test]
    fn sync_unknown_path_gets_the_default_response() {
        let adapter = SyncGateway::new(gateway(Calls::default()));
        let response = adapter.call(Environ::new("GET", "/missing")).unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(response.into_bytes().is_empty());
    }

    #[test]
    fn sync_oversized_body_is_refused_without_running_the_gateway() {
        let calls = Calls::default();
        let adapter = SyncGateway::new(gateway(calls.clone())).with_max_body_size(4);

        let response = adapter
            .call(Environ::new("POST", "/echo").with_body(Cursor::new(b"12345".to_vec())))
            .unwrap();
        assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let response = adapter
            .call(Environ::new("POST", "/echo").with_body(Cursor::new(b"1234".to_vec())))
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_unlimited_body_size_reads_the_whole_body() {
        let adapter = SyncGateway::new(gateway(Calls::default())).with_max_body_size(usize::MAX);

        let response = adapter
            .call(Environ::new("POST", "/echo").with_body(Cursor::new(b"payload".to_vec())))
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(&response.into_bytes()[..], b"payload");
    }

    #[test]
    fn sync_malformed_environ_is_an_error() {
        let adapter = SyncGateway::new(gateway(Calls::default()));

        let bad_method = adapter.call(Environ::new("GE T", "/tags")).unwrap_err();
        assert!(matches!(bad_method, TransportError::InvalidRequest(_)));

        let bad_header = adapter
            .call(Environ::new("GET", "/tags").with_header("bad header", "x"))
            .unwrap_err();
        assert!(matches!(bad_header, TransportError::InvalidRequest(_)));
    }

    #[test]
    fn sync_gateway_is_shared_between_threads() {
        let calls = Calls::default();
        let adapter = SyncGateway::new(gateway(calls.clone()));

        std::thread::scope(|scope| {
            for i in 0..8 {
                let adapter = adapter.clone();
                scope.spawn(move || {
                    let body = format!("thread {i}");
                    let response = adapter
                        .call(
                            Environ::new("POST", "/echo")
                                .with_body(Cursor::new(body.clone().into_bytes())),
                        )
                        .unwrap();
                    assert_eq!(response.into_bytes(), Bytes::from(body));
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Async adapter: in-memory server
    // ─────────────────────────────────────────────────────────────────────

    struct ChannelEvents(mpsc::UnboundedReceiver<ReceiveEvent>);

    impl EventSource for ChannelEvents {
        async fn receive(&mut self) -> Result<ReceiveEvent, TransportError> {
            self.0.recv().await.ok_or(TransportError::ConnectionClosed)
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<SendEvent>);

    impl EventSink for ChannelSink {
        async fn send(&mut self, event: SendEvent) -> Result<(), TransportError> {
            self.0.send(event).map_err(|_| TransportError::ConnectionClosed)
        }
    }

    struct Server {
        events: mpsc::UnboundedSender<ReceiveEvent>,
        sent: mpsc::UnboundedReceiver<SendEvent>,
    }

    impl Server {
        async fn next(&mut self) -> Option<SendEvent> {
            timeout(WAIT, self.sent.recv()).await.expect("no event sent")
        }
    }

    fn server() -> (Server, ChannelEvents, ChannelSink) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let server = Server {
            events: events_tx,
            sent: sent_rx,
        };
        (server, ChannelEvents(events_rx), ChannelSink(sent_tx))
    }

    fn response_status(event: Option<SendEvent>) -> StatusCode {
        match event {
            Some(SendEvent::HttpResponseStart { status, .. }) => status,
            other => panic!("expected a response start, got {other:?}"),
        }
    }

    fn body_event(body: &'static str, more_body: bool) -> Option<SendEvent> {
        Some(SendEvent::HttpResponseBody {
            body: Bytes::from_static(body.as_bytes()),
            more_body,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Async adapter: HTTP
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_http_body_arrives_in_chunks() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"hel"),
                more_body: true,
            })
            .unwrap();
        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"lo"),
                more_body: false,
            })
            .unwrap();

        adapter
            .call(Scope::http(Method::POST, "/echo"), source, sink)
            .await
            .unwrap();

        assert_eq!(response_status(server.next().await), StatusCode::CREATED);
        assert_eq!(server.next().await, body_event("hello", true));
        assert_eq!(server.next().await, body_event("", false));
        assert_eq!(server.next().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_oversized_body_is_refused_without_running_the_gateway() {
        let calls = Calls::default();
        let adapter = AsyncGateway::new(gateway(calls.clone())).with_max_body_size(4);
        let (mut server, source, sink) = server();

        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"123"),
                more_body: true,
            })
            .unwrap();
        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"45"),
                more_body: false,
            })
            .unwrap();

        adapter
            .call(Scope::http(Method::POST, "/echo"), source, sink)
            .await
            .unwrap();

        assert_eq!(
            response_status(server.next().await),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(server.next().await, body_event("", false));
        assert_eq!(server.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_http_streams_the_response_body() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::new(),
                more_body: false,
            })
            .unwrap();
        adapter
            .call(Scope::http(Method::GET, "/stream"), source, sink)
            .await
            .unwrap();

        assert_eq!(response_status(server.next().await), StatusCode::OK);
        assert_eq!(server.next().await, body_event("one", true));
        assert_eq!(server.next().await, body_event("two", true));
        assert_eq!(server.next().await, body_event("", false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_http_scope_fields_reach_the_request() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        server
            .events
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::new(),
                more_body: false,
            })
            .unwrap();
        adapter
            .call(
                Scope::http(Method::GET, "/tags")
                    .with_query("q=1")
                    .with_headers(headers),
                source,
                sink,
            )
            .await
            .unwrap();

        assert_eq!(response_status(server.next().await), StatusCode::OK);
        assert_eq!(server.next().await, body_event("GET q=1 http a,b", true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_http_client_leaving_early_runs_nothing() {
        let calls = Calls::default();
        let adapter = AsyncGateway::new(gateway(calls.clone()));
        let (mut server, source, sink) = server();

        server.events.send(ReceiveEvent::HttpDisconnect).unwrap();
        adapter
            .call(Scope::http(Method::POST, "/echo"), source, sink)
            .await
            .unwrap();

        assert_eq!(server.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_http_unexpected_event_is_an_error() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (server, source, sink) = server();

        server.events.send(ReceiveEvent::WebSocketConnect).unwrap();
        let err = adapter
            .call(Scope::http(Method::GET, "/tags"), source, sink)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransportError::UnexpectedEvent {
                expected: "http.request",
                received: "websocket.connect",
            }
        ));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Async adapter: WebSocket
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_websocket_echo_session() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        server.events.send(ReceiveEvent::WebSocketConnect).unwrap();
        let call = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.call(Scope::websocket("/ws"), source, sink).await }
        });

        assert_eq!(
            server.next().await,
            Some(SendEvent::WebSocketAccept {
                subprotocol: Some("chat".into()),
                headers: HeaderMap::new(),
            })
        );

        server
            .events
            .send(ReceiveEvent::WebSocketMessage(Message::from("marco")))
            .unwrap();
        assert_eq!(
            server.next().await,
            Some(SendEvent::WebSocketSend(Message::from("marco")))
        );

        server
            .events
            .send(ReceiveEvent::WebSocketDisconnect {
                code: close_code::GOING_AWAY,
            })
            .unwrap();
        timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(server.next().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_websocket_rejection_is_an_http_response() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        server.events.send(ReceiveEvent::WebSocketConnect).unwrap();
        adapter
            .call(Scope::websocket("/ws-deny"), source, sink)
            .await
            .unwrap();

        assert_eq!(response_status(server.next().await), StatusCode::UNAUTHORIZED);
        assert_eq!(server.next().await, body_event("login first", false));
        assert_eq!(server.next().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_websocket_nobody_accepts_closes() {
        let adapter = AsyncGateway::new(gateway(Calls::default()));
        let (mut server, source, sink) = server();

        server.events.send(ReceiveEvent::WebSocketConnect).unwrap();
        adapter
            .call(Scope::websocket("/elsewhere"), source, sink)
            .await
            .unwrap();

        assert_eq!(
            server.next().await,
            Some(SendEvent::WebSocketClose {
                code: close_code::NORMAL,
                reason: None,
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_websocket_disconnect_before_connect_runs_nothing() {
        let calls = Calls::default();
        let adapter = AsyncGateway::new(gateway(calls.clone()));
        let (mut server, source, sink) = server();

        server
            .events
            .send(ReceiveEvent::WebSocketDisconnect { code: 1001 })
            .unwrap();
        adapter
            .call(Scope::websocket("/ws"), source, sink)
            .await
            .unwrap();

        assert_eq!(server.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
