//! Gantry Transport Layer
//!
//! Connects a [`gantry_gateway::Gateway`] to the outside world:
//! - a synchronous adapter for thread-per-request servers
//! - an asynchronous, event-driven adapter (connection scope plus receive
//!   and send event streams)
//! - the bridge that lets blocking socket handlers run against an event loop
//! - an Axum server that serves a gateway over HTTP and WebSocket
//!
//! Gateway work never runs on the event loop: plain requests go to the
//! blocking pool and every upgraded connection gets a dedicated blocking
//! worker.

pub mod async_adapter;
pub mod blocking;
pub mod bridge;
pub mod error;
pub mod server;
pub mod session;
pub mod sync_adapter;

pub use async_adapter::{AsyncGateway, EventSink, EventSource, ReceiveEvent, Scope, ScopeKind, SendEvent};
pub use bridge::{Bridge, Connection, FrameSink, FrameSource, Handshake, SourceEvent};
pub use error::TransportError;
pub use server::{GatewayServer, TransportConfig};
pub use session::{DEFAULT_CHANNEL_CAPACITY, LoopEnd, SocketSession};
pub use sync_adapter::{DEFAULT_MAX_BODY_SIZE, Environ, SyncGateway, SyncResponse};
