//! Asynchronous transport adapter.
//!
//! An event-driven server hands the adapter a connection [`Scope`], an
//! [`EventSource`] to pull events from and an [`EventSink`] to push events
//! to. Plain requests run through [`Gateway::handle`] on the blocking pool;
//! upgrade scopes go through the [`Bridge`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use gantry_gateway::Gateway;
use gantry_protocol::{Context, Message, Request, close_code};
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};

use crate::blocking;
use crate::bridge::{Bridge, FrameSink, FrameSource, Handshake, SourceEvent};
use crate::error::TransportError;
use crate::session::DEFAULT_CHANNEL_CAPACITY;
use crate::sync_adapter::DEFAULT_MAX_BODY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Http,
    WebSocket,
}

/// Connection metadata handed over by the server.
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub scheme: String,
    pub remote_addr: Option<SocketAddr>,
}

impl Scope {
    pub fn http(method: Method, path: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Http,
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            scheme: "http".into(),
            remote_addr: None,
        }
    }

    pub fn websocket(path: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::WebSocket,
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            scheme: "ws".into(),
            remote_addr: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn into_request(self, body: Bytes) -> Request {
        let mut request = Request::new(self.method, self.path)
            .with_query(self.query.unwrap_or_default())
            .with_headers(self.headers)
            .with_scheme(self.scheme)
            .with_body(body);
        if let Some(addr) = self.remote_addr {
            request = request.with_remote_addr(addr);
        }
        request
    }
}

/// Events the server delivers to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    HttpRequest { body: Bytes, more_body: bool },
    HttpDisconnect,
    WebSocketConnect,
    WebSocketMessage(Message),
    WebSocketDisconnect { code: u16 },
}

impl ReceiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HttpRequest { .. } => "http.request",
            Self::HttpDisconnect => "http.disconnect",
            Self::WebSocketConnect => "websocket.connect",
            Self::WebSocketMessage(_) => "websocket.receive",
            Self::WebSocketDisconnect { .. } => "websocket.disconnect",
        }
    }
}

/// Events the adapter asks the server to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    HttpResponseStart {
        status: StatusCode,
        headers: HeaderMap,
    },
    HttpResponseBody {
        body: Bytes,
        more_body: bool,
    },
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: HeaderMap,
    },
    WebSocketSend(Message),
    WebSocketClose {
        code: u16,
        reason: Option<String>,
    },
}

/// Pulls events from the server. `receive` must be cancel-safe.
pub trait EventSource: Send {
    fn receive(&mut self) -> impl Future<Output = Result<ReceiveEvent, TransportError>> + Send;
}

/// Pushes events to the server.
pub trait EventSink: Send {
    fn send(&mut self, event: SendEvent) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Drives a [`Gateway`] from an event-driven server.
pub struct AsyncGateway<C: Context> {
    gateway: Arc<Gateway<C>>,
    bridge: Bridge<C>,
    max_body_size: usize,
}

impl<C: Context> AsyncGateway<C> {
    pub fn new(gateway: Arc<Gateway<C>>) -> Self {
        Self::with_capacity(gateway, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Use `capacity` for both channels of every socket session.
    pub fn with_capacity(gateway: Arc<Gateway<C>>, capacity: usize) -> Self {
        let bridge = Bridge::with_capacity(gateway.clone(), capacity);
        Self {
            gateway,
            bridge,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Refuse request bodies larger than `max_body_size` bytes with `413`.
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway<C>> {
        &self.gateway
    }

    /// Serve one connection scope to completion.
    pub async fn call<S, K>(&self, scope: Scope, source: S, sink: K) -> Result<(), TransportError>
    where
        S: EventSource,
        K: EventSink,
    {
        match scope.kind {
            ScopeKind::Http => self.serve_http(scope, source, sink).await,
            ScopeKind::WebSocket => self.serve_websocket(scope, source, sink).await,
        }
    }

    async fn serve_http<S, K>(
        &self,
        scope: Scope,
        mut source: S,
        mut sink: K,
    ) -> Result<(), TransportError>
    where
        S: EventSource,
        K: EventSink,
    {
        let mut body = BytesMut::new();
        loop {
            match source.receive().await? {
                ReceiveEvent::HttpRequest {
                    body: chunk,
                    more_body,
                } => {
                    if body.len().saturating_add(chunk.len()) > self.max_body_size {
                        warn!(
                            "request body for {} exceeds {} bytes",
                            scope.path, self.max_body_size
                        );
                        return payload_too_large(&mut sink).await;
                    }
                    body.extend_from_slice(&chunk);
                    if !more_body {
                        break;
                    }
                }
                ReceiveEvent::HttpDisconnect => {
                    debug!("client left before the request body was read: {}", scope.path);
                    return Ok(());
                }
                other => {
                    return Err(TransportError::UnexpectedEvent {
                        expected: "http.request",
                        received: other.kind(),
                    });
                }
            }
        }

        let request = scope.into_request(body.freeze());
        let response = blocking::dispatch(self.gateway.clone(), request).await?;
        let (status, headers, body) = response.into_parts();

        sink.send(SendEvent::HttpResponseStart {
            status: status.unwrap_or(StatusCode::OK),
            headers,
        })
        .await?;

        let mut chunks = blocking::body_channel(body);
        while let Some(chunk) = chunks.recv().await {
            sink.send(SendEvent::HttpResponseBody {
                body: chunk,
                more_body: true,
            })
            .await?;
        }
        sink.send(SendEvent::HttpResponseBody {
            body: Bytes::new(),
            more_body: false,
        })
        .await
    }

    async fn serve_websocket<S, K>(
        &self,
        scope: Scope,
        mut source: S,
        mut sink: K,
    ) -> Result<(), TransportError>
    where
        S: EventSource,
        K: EventSink,
    {
        match source.receive().await? {
            ReceiveEvent::WebSocketConnect => {}
            ReceiveEvent::WebSocketDisconnect { code } => {
                debug!("client left before the upgrade code={code}: {}", scope.path);
                return Ok(());
            }
            other => {
                return Err(TransportError::UnexpectedEvent {
                    expected: "websocket.connect",
                    received: other.kind(),
                });
            }
        }

        match self.bridge.start(scope.into_request(Bytes::new())).await {
            Handshake::Accepted(connection) => {
                sink.send(SendEvent::WebSocketAccept {
                    subprotocol: connection.subprotocol().map(str::to_owned),
                    headers: connection.headers().clone(),
                })
                .await?;
                connection.run(SourceFrames(source), SinkFrames(sink)).await;
                Ok(())
            }
            Handshake::Rejected(rejection) => {
                sink.send(SendEvent::HttpResponseStart {
                    status: rejection.status,
                    headers: rejection.headers,
                })
                .await?;
                sink.send(SendEvent::HttpResponseBody {
                    body: rejection.body,
                    more_body: false,
                })
                .await
            }
            Handshake::Closed { code, reason } => {
                sink.send(SendEvent::WebSocketClose { code, reason }).await
            }
        }
    }
}

impl<C: Context> Clone for AsyncGateway<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            bridge: self.bridge.clone(),
            max_body_size: self.max_body_size,
        }
    }
}

async fn payload_too_large<K: EventSink>(sink: &mut K) -> Result<(), TransportError> {
    sink.send(SendEvent::HttpResponseStart {
        status: StatusCode::PAYLOAD_TOO_LARGE,
        headers: HeaderMap::new(),
    })
    .await?;
    sink.send(SendEvent::HttpResponseBody {
        body: Bytes::new(),
        more_body: false,
    })
    .await
}

struct SourceFrames<S>(S);

impl<S: EventSource> FrameSource for SourceFrames<S> {
    async fn next_frame(&mut self) -> SourceEvent {
        loop {
            match self.0.receive().await {
                Ok(ReceiveEvent::WebSocketMessage(message)) => {
                    return SourceEvent::Message(message);
                }
                Ok(ReceiveEvent::WebSocketDisconnect { code }) => {
                    return SourceEvent::Disconnected { code };
                }
                Ok(other) => debug!("ignoring {} on an open socket", other.kind()),
                Err(e) => {
                    debug!("socket event source failed: {e}");
                    return SourceEvent::Disconnected {
                        code: close_code::ABNORMAL,
                    };
                }
            }
        }
    }
}

struct SinkFrames<K>(K);

impl<K: EventSink> FrameSink for SinkFrames<K> {
    async fn send_frame(&mut self, message: Message) -> Result<(), TransportError> {
        self.0.send(SendEvent::WebSocketSend(message)).await
    }

    async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), TransportError> {
        self.0.send(SendEvent::WebSocketClose { code, reason }).await
    }
}
