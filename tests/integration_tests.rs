//! End-to-end integration tests: HTTP requests and WebSocket sessions
//! through a running server, with blocking handlers behind it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use gantry_gateway::{EmptyResponseHandler, ErrorFormat, Gateway, HttpErrorHandler};
use gantry_protocol::{Body, HttpError, SocketError, upgrade_method};
use gantry_transport::{GatewayServer, TransportConfig};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Error as WsError, tungstenite::Message};

type Log = Arc<Mutex<Vec<String>>>;

const WAIT: Duration = Duration::from_secs(5);

fn allow(method: &Method, expected: &Method) -> Result<(), HttpError> {
    if method == expected {
        Ok(())
    } else {
        Err(HttpError::method_not_allowed(method))
    }
}

/// Routes used by every test. Socket handlers record how their session
/// ended in `log`.
fn test_gateway(log: Log) -> Arc<Gateway> {
    let gateway = Gateway::builder()
        .request_fn(move |chain, context, response| {
            let request = context.request();
            let method = request.method().clone();

            match request.path() {
                "/hello" => {
                    allow(&method, &Method::GET)?;
                    chain.respond(response, StatusCode::OK, "Hello, world!\n");
                }
                "/echo" => {
                    allow(&method, &Method::POST)?;
                    chain.respond(response, StatusCode::OK, request.body().clone());
                }
                "/stream" => {
                    let chunks = (1..=3).map(|i| Bytes::from(format!("chunk {i}\n")));
                    chain.respond(response, StatusCode::OK, Body::stream(chunks));
                }
                "/info" => {
                    response.set_json(&json!({
                        "query": request.query(),
                        "scheme": request.scheme(),
                        "remote": request.remote_addr().map(|a| a.ip().to_string()),
                    }))?;
                    response.set_status(StatusCode::OK);
                    chain.stop();
                }
                "/boom" => chain.throw("boom"),
                "/ws" => {
                    allow(&method, &upgrade_method())?;
                    let Some(upgrade) = request.upgrade() else {
                        return Ok(());
                    };
                    let protocol = request
                        .header("sec-websocket-protocol")
                        .filter(|offered| offered.split(',').any(|p| p.trim() == "chat"))
                        .map(|_| "chat");

                    let socket = upgrade.accept_with(protocol, HeaderMap::new())?;
                    loop {
                        match socket.receive() {
                            Ok(message) => socket.send(message)?,
                            Err(SocketError::Disconnected { code }) => {
                                log.lock().push(format!("disconnected {code}"));
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    chain.stop();
                }
                "/bye" => {
                    let Some(upgrade) = request.upgrade() else {
                        return Ok(());
                    };
                    let socket = upgrade.accept()?;
                    socket.send("bye")?;
                    socket.close(4001, Some("done"))?;
                    chain.stop();
                }
                "/private" => {
                    response.set_status(StatusCode::UNAUTHORIZED);
                    response.set_text("login first");
                    chain.stop();
                }
                _ => {}
            }
            Ok(())
        })
        .response_handler(EmptyResponseHandler::default().with_body("Not Found"))
        .exception_handler(HttpErrorHandler::new(ErrorFormat::Json))
        .build();
    Arc::new(gateway)
}

/// Start a test server on an OS-assigned port.
async fn start_test_server(config: TransportConfig) -> (GatewayServer, Log) {
    let log = Log::default();
    let config = TransportConfig {
        port: 0,
        hostname: "127.0.0.1".into(),
        ..config
    };
    let server = GatewayServer::start(config, test_gateway(log.clone()))
        .await
        .expect("Failed to start server");
    (server, log)
}

async fn start_default_server() -> (GatewayServer, Log) {
    start_test_server(TransportConfig::default()).await
}

fn http_url(server: &GatewayServer, path: &str) -> String {
    format!("http://127.0.0.1:{}{path}", server.port())
}

fn ws_url(server: &GatewayServer, path: &str) -> String {
    format!("ws://127.0.0.1:{}{path}", server.port())
}

/// Status of a refused WebSocket handshake.
async fn refused_status(url: &str) -> u16 {
    match connect_async(url).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected an HTTP answer, got {other}"),
        Ok(_) => panic!("expected the upgrade to be refused"),
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_get_is_served_by_blocking_handlers() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::get(http_url(&server, "/hello")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello, world!\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_post_body_is_echoed() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::Client::new()
        .post(http_url(&server, "/echo"))
        .body("round and round")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "round and round");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_streaming_body_arrives_whole() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::get(http_url(&server, "/stream")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        "chunk 1\nchunk 2\nchunk 3\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_request_fields_reach_handlers() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::get(http_url(&server, "/info?page=2")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let info: Value = response.json().await.unwrap();
    assert_eq!(info["query"], "page=2");
    assert_eq!(info["scheme"], "http");
    assert_eq!(info["remote"], "127.0.0.1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_unknown_path_gets_default_response() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::get(http_url(&server, "/nowhere")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(response.text().await.unwrap(), "Not Found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_error_is_rendered_as_json() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::Client::new()
        .delete(http_url(&server, "/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], 405);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_unhandled_error_is_500() {
    let (server, _log) = start_default_server().await;

    let response = reqwest::get(http_url(&server, "/boom")).await.unwrap();
    assert_eq!(response.status().as_u16(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_oversized_body_is_413() {
    let (server, _log) = start_test_server(TransportConfig {
        max_body_size: 16,
        ..TransportConfig::default()
    })
    .await;

    let response = reqwest::Client::new()
        .post(http_url(&server, "/echo"))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 413);
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_echo_round_trip() {
    let (server, log) = start_default_server().await;
    let (mut ws, _) = connect_async(ws_url(&server, "/ws"))
        .await
        .expect("Failed to connect");

    ws.send(Message::text("ping")).await.unwrap();
    let reply = timeout(WAIT, ws.next())
        .await
        .expect("Timeout waiting for echo")
        .expect("Stream ended")
        .expect("WebSocket error");
    assert_eq!(reply, Message::text("ping"));

    ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::binary(vec![0u8, 1, 2]));

    ws.close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "finished".into(),
    }))
    .await
    .unwrap();

    wait_for(|| !log.lock().is_empty()).await;
    assert_eq!(*log.lock(), vec!["disconnected 4000".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_close_is_answered() {
    let (server, log) = start_default_server().await;
    let (mut ws, _) = connect_async(ws_url(&server, "/ws"))
        .await
        .expect("Failed to connect");

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "bye".into(),
    })))
    .await
    .unwrap();

    match timeout(WAIT, ws.next()).await.expect("no close reply") {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    wait_for(|| !log.lock().is_empty()).await;
    assert_eq!(*log.lock(), vec!["disconnected 4000".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_subprotocol_is_negotiated() {
    let (server, _log) = start_default_server().await;

    let mut request = ws_url(&server, "/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "chat".parse().unwrap());
    let (_ws, response) = connect_async(request).await.expect("Failed to connect");

    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("chat")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_messages_arrive_before_server_close() {
    let (server, _log) = start_default_server().await;
    let (mut ws, _) = connect_async(ws_url(&server, "/bye"))
        .await
        .expect("Failed to connect");

    let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, Message::text("bye"));

    match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4001);
            assert_eq!(frame.reason.as_str(), "done");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_rejection_is_an_http_response() {
    let (server, _log) = start_default_server().await;
    assert_eq!(refused_status(&ws_url(&server, "/private")).await, 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_to_http_route_is_405() {
    let (server, _log) = start_default_server().await;
    assert_eq!(refused_status(&ws_url(&server, "/hello")).await, 405);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_nobody_accepts_is_403() {
    let (server, _log) = start_default_server().await;
    assert_eq!(refused_status(&ws_url(&server, "/nowhere")).await, 403);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_connection_limit_is_enforced() {
    let (server, _log) = start_test_server(TransportConfig {
        max_connections: Some(1),
        ..TransportConfig::default()
    })
    .await;

    let (first, _) = connect_async(ws_url(&server, "/ws"))
        .await
        .expect("Failed to connect");
    wait_for(|| server.connection_count() == 1).await;

    assert_eq!(refused_status(&ws_url(&server, "/ws")).await, 503);

    drop(first);
    wait_for(|| server.connection_count() == 0).await;
    let (_second, _) = connect_async(ws_url(&server, "/ws"))
        .await
        .expect("Failed to connect after the first left");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upgrades_respect_the_connection_limit() {
    let (server, _log) = start_test_server(TransportConfig {
        max_connections: Some(2),
        ..TransportConfig::default()
    })
    .await;

    let url = ws_url(&server, "/ws");
    let attempts = join_all((0..8).map(|_| connect_async(url.clone()))).await;

    let mut open = Vec::new();
    let mut refused = 0;
    for attempt in attempts {
        match attempt {
            Ok((ws, _)) => open.push(ws),
            Err(WsError::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
                refused += 1;
            }
            Err(other) => panic!("unexpected handshake error: {other}"),
        }
    }

    assert_eq!(open.len(), 2);
    assert_eq!(refused, 6);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_stops_gracefully() {
    let (mut server, _log) = start_default_server().await;
    let url = http_url(&server, "/hello");
    assert_eq!(reqwest::get(&url).await.unwrap().status().as_u16(), 200);

    timeout(WAIT, server.stop()).await.expect("stop timed out");
    assert!(reqwest::get(&url).await.is_err());
}
