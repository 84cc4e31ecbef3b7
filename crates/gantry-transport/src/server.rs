//! HTTP and WebSocket server using Axum.
//!
//! Every path goes through the gateway. Plain requests are buffered and run
//! on the blocking pool; WebSocket upgrades are run through the [`Bridge`]
//! with the `WEBSOCKET` pseudo-method, and the handshake answer decides
//! whether the client gets `101` or an ordinary HTTP response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{
        ConnectInfo, FromRequestParts, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket},
    },
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response as AxumResponse},
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{self, SplitSink, SplitStream},
};
use gantry_gateway::Gateway;
use gantry_protocol::{Body, Context, Message, Rejection, Request, Response, close_code};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::blocking;
use crate::bridge::{Bridge, FrameSink, FrameSource, Handshake, SourceEvent};
use crate::error::TransportError;
use crate::session::DEFAULT_CHANNEL_CAPACITY;
use crate::sync_adapter::DEFAULT_MAX_BODY_SIZE;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent WebSocket connections
    pub max_connections: Option<usize>,
    /// Maximum buffered request body, in bytes
    pub max_body_size: usize,
    /// Capacity of both channels of every socket session
    pub channel_capacity: usize,
    /// Enable verbose connection logging
    pub verbose_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            hostname: "127.0.0.1".into(),
            max_connections: Some(256),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            verbose_logging: false,
        }
    }
}

struct AppState<C: Context> {
    gateway: Arc<Gateway<C>>,
    bridge: Bridge<C>,
    config: TransportConfig,
    /// Open WebSocket connections
    connections: Arc<AtomicUsize>,
}

/// A running server.
pub struct GatewayServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound address
    local_addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl GatewayServer {
    /// Bind and start serving `gateway`.
    pub async fn start<C: Context>(
        config: TransportConfig,
        gateway: Arc<Gateway<C>>,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let connections = Arc::new(AtomicUsize::new(0));

        let state = Arc::new(AppState {
            bridge: Bridge::with_capacity(gateway.clone(), config.channel_capacity),
            gateway,
            config: config.clone(),
            connections: connections.clone(),
        });

        let app = Router::new().fallback(dispatch::<C>).with_state(state);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port)
            .parse()
            .map_err(|e| TransportError::Config(format!("invalid listen address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!("Gantry listening on http://{local_addr}");

        let handle = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
            if let Err(e) = served {
                error!("server error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            local_addr,
            connections,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Gantry server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch<C: Context>(
    State(state): State<Arc<AppState<C>>>,
    request: axum::extract::Request,
) -> AxumResponse {
    let (mut parts, body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    if is_websocket_upgrade(&parts) {
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        return upgrade(state, &parts, remote_addr, ws).await;
    }

    let body = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!("request body for {} rejected: {e}", parts.uri.path());
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request = build_request(&parts, remote_addr, "http").with_body(body);
    if state.config.verbose_logging {
        debug!("{} {}", parts.method, parts.uri);
    }

    match blocking::dispatch(state.gateway.clone(), request).await {
        Ok(response) => into_axum_response(response),
        Err(e) => {
            error!("{e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn upgrade<C: Context>(
    state: Arc<AppState<C>>,
    parts: &Parts,
    remote_addr: Option<SocketAddr>,
    ws: WebSocketUpgrade,
) -> AxumResponse {
    // The slot is held through the handshake and released if it fails.
    let Some(guard) =
        ConnectionGuard::reserve(state.connections.clone(), state.config.max_connections)
    else {
        warn!(
            "Connection rejected: max connections reached ({})",
            state.config.max_connections.unwrap_or_default()
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let request = build_request(parts, remote_addr, "ws");
    match state.bridge.start(request).await {
        Handshake::Accepted(connection) => {
            let verbose = state.config.verbose_logging;
            let extra_headers = connection.headers().clone();

            let mut ws = ws;
            if let Some(protocol) = connection.subprotocol() {
                ws = ws.protocols([protocol.to_owned()]);
            }

            let mut response = ws
                .on_upgrade(move |socket| async move {
                    let _guard = guard;
                    let id = connection.id();
                    if verbose {
                        info!("Client connected: {id}");
                    }
                    let (sink, source) = socket.split();
                    connection.run(AxumFrames(source), AxumSink(sink)).await;
                    if verbose {
                        info!("Client disconnected: {id}");
                    }
                })
                .into_response();
            response.headers_mut().extend(extra_headers);
            response
        }
        Handshake::Rejected(rejection) => rejection_response(rejection),
        Handshake::Closed { code, .. } => {
            debug!("upgrade closed before accept code={code}");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn is_websocket_upgrade(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn build_request(parts: &Parts, remote_addr: Option<SocketAddr>, scheme: &str) -> Request {
    let mut request = Request::new(parts.method.clone(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default())
        .with_headers(parts.headers.clone())
        .with_scheme(scheme);
    if let Some(addr) = remote_addr {
        request = request.with_remote_addr(addr);
    }
    request
}

fn into_axum_response(response: Response) -> AxumResponse {
    let (status, headers, body) = response.into_parts();
    let body = match body {
        Body::Empty => AxumBody::empty(),
        Body::Bytes(bytes) => AxumBody::from(bytes),
        stream @ Body::Stream(_) => {
            let chunks = blocking::body_channel(stream);
            AxumBody::from_stream(stream::unfold(chunks, |mut chunks| async move {
                let chunk = chunks.recv().await?;
                Some((Ok::<Bytes, Infallible>(chunk), chunks))
            }))
        }
    };

    let mut response = AxumResponse::new(body);
    *response.status_mut() = status.unwrap_or(StatusCode::OK);
    *response.headers_mut() = headers;
    response
}

fn rejection_response(rejection: Rejection) -> AxumResponse {
    let mut response = AxumResponse::new(AxumBody::from(rejection.body));
    *response.status_mut() = rejection.status;
    *response.headers_mut() = rejection.headers;
    response
}

/// Counts a WebSocket connection, from its handshake until it is gone.
struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Take a slot, unless `max` are already taken.
    fn reserve(connections: Arc<AtomicUsize>, max: Option<usize>) -> Option<Self> {
        connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match max {
                Some(max) if current >= max => None,
                _ => Some(current + 1),
            })
            .ok()?;
        Some(Self { connections })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket frames
// ─────────────────────────────────────────────────────────────────────────────

struct AxumFrames(SplitStream<WebSocket>);

impl FrameSource for AxumFrames {
    async fn next_frame(&mut self) -> SourceEvent {
        loop {
            match self.0.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return SourceEvent::Message(Message::Text(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return SourceEvent::Message(Message::Binary(data));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return match frame {
                        Some(frame) => SourceEvent::Close {
                            code: frame.code,
                            reason: Some(frame.reason.as_str().to_owned())
                                .filter(|reason| !reason.is_empty()),
                        },
                        None => SourceEvent::Close {
                            code: close_code::NO_STATUS,
                            reason: None,
                        },
                    };
                }
                // Axum answers pings itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read error: {e}");
                    return SourceEvent::Disconnected {
                        code: close_code::ABNORMAL,
                    };
                }
                None => {
                    return SourceEvent::Disconnected {
                        code: close_code::ABNORMAL,
                    };
                }
            }
        }
    }
}

struct AxumSink(SplitSink<WebSocket, WsMessage>);

impl FrameSink for AxumSink {
    async fn send_frame(&mut self, message: Message) -> Result<(), TransportError> {
        let frame = match message {
            Message::Text(text) => WsMessage::Text(text.into()),
            Message::Binary(data) => WsMessage::Binary(data),
        };
        self.0
            .send(frame)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.unwrap_or_default().into(),
        };
        self.0
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.0
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
