//! Blocking socket surface used by handlers after an upgrade.
//!
//! A request handler finds a [`SocketUpgrade`] on an upgrade request and
//! either accepts it, getting a [`WebSocket`] back, or rejects it with a plain
//! HTTP response. Both types are thin wrappers over a [`SocketAdapter`], the
//! seam the transport layer implements on top of its event loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;

use crate::error::SocketError;
use crate::response::{Rejection, Response};

/// WebSocket close codes used by the gateway.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reported when the peer went away without a close code.
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Close code and reason of a session, from whichever side closed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: Option<String>,
}

/// A data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value.into())
    }
}

/// Events flowing from the event loop to the blocking worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The client asked for the upgrade; always the first event.
    Connect,
    Message(Message),
    /// Sentinel: the transport is gone. Nothing follows it.
    Disconnect { code: u16 },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Message(_) => "message",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

/// Commands flowing from the blocking worker to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Accept {
        subprotocol: Option<String>,
        headers: HeaderMap,
    },
    Reject(Rejection),
    Message(Message),
    Close { code: u16, reason: Option<String> },
}

/// Lifecycle of a socket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Blocking operations a transport provides for one upgraded connection.
///
/// Every method may block the calling thread. Implementations must never be
/// driven from inside an async task.
pub trait SocketAdapter: Send + Sync + 'static {
    /// Next inbound event. The disconnect sentinel is reported as
    /// [`SocketError::Disconnected`], on this call and every later one.
    fn receive(&self, timeout: Option<Duration>) -> Result<InboundEvent, SocketError>;

    /// Queue a frame for writing. Blocks while the outbound queue is full.
    fn send(&self, message: Message, timeout: Option<Duration>) -> Result<(), SocketError>;

    /// Complete the upgrade handshake.
    fn accept(&self, subprotocol: Option<String>, headers: HeaderMap) -> Result<(), SocketError>;

    /// Turn the upgrade down with a plain HTTP response.
    fn reject(&self, rejection: Rejection) -> Result<(), SocketError>;

    /// Start closing. A no-op once the session is closing or closed.
    fn close(&self, code: u16, reason: Option<String>) -> Result<(), SocketError>;

    fn state(&self) -> SessionState;

    /// How the session was closed, once either side closed it.
    fn close_status(&self) -> Option<CloseStatus> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeStatus {
    Pending,
    Upgraded,
    Rejected,
}

/// The pending upgrade attached to a `WEBSOCKET` request.
///
/// It must be either accepted or rejected. Accepting sends the switching
/// protocols response and returns the bidirectional [`WebSocket`]; rejecting
/// answers with an ordinary HTTP response and ends the connection.
pub struct SocketUpgrade {
    adapter: Arc<dyn SocketAdapter>,
    status: Mutex<UpgradeStatus>,
}

impl SocketUpgrade {
    pub fn new(adapter: Arc<dyn SocketAdapter>) -> Self {
        Self {
            adapter,
            status: Mutex::new(UpgradeStatus::Pending),
        }
    }

    /// Accept without a subprotocol or extra headers.
    pub fn accept(&self) -> Result<WebSocket, SocketError> {
        self.accept_with(None, HeaderMap::new())
    }

    /// Perform the upgrade handshake: consume the transport's connect event,
    /// then tell the transport to switch protocols.
    ///
    /// If the first event is anything but a connect, the connection is closed
    /// with `1003` and a protocol error is returned.
    pub fn accept_with(
        &self,
        subprotocol: Option<&str>,
        headers: HeaderMap,
    ) -> Result<WebSocket, SocketError> {
        let mut status = self.status.lock();
        check_pending(*status)?;

        match self.adapter.receive(None)? {
            InboundEvent::Connect => {
                self.adapter
                    .accept(subprotocol.map(str::to_owned), headers)?;
                *status = UpgradeStatus::Upgraded;
                Ok(WebSocket::new(self.adapter.clone()))
            }
            other => {
                let reason = format!("unexpected event {}", other.kind());
                let _ = self
                    .adapter
                    .close(close_code::UNSUPPORTED_DATA, Some(reason.clone()));
                Err(SocketError::Protocol(reason))
            }
        }
    }

    /// Reject the upgrade and answer with `response` instead.
    pub fn reject(&self, response: Response) -> Result<(), SocketError> {
        let mut status = self.status.lock();
        check_pending(*status)?;
        self.adapter.reject(Rejection::from_response(response))?;
        *status = UpgradeStatus::Rejected;
        Ok(())
    }

    pub fn is_upgraded(&self) -> bool {
        *self.status.lock() == UpgradeStatus::Upgraded
    }

    pub fn is_rejected(&self) -> bool {
        *self.status.lock() == UpgradeStatus::Rejected
    }

    /// Close a connection that was neither accepted nor rejected. Has no
    /// effect otherwise: a rejection already ended the connection, and an
    /// accepted one is closed through its [`WebSocket`].
    pub fn close(&self) -> Result<(), SocketError> {
        if *self.status.lock() != UpgradeStatus::Pending {
            return Ok(());
        }
        self.adapter.close(close_code::NORMAL, None)
    }

    pub fn state(&self) -> SessionState {
        self.adapter.state()
    }
}

fn check_pending(status: UpgradeStatus) -> Result<(), SocketError> {
    match status {
        UpgradeStatus::Pending => Ok(()),
        UpgradeStatus::Upgraded => Err(SocketError::AlreadyUpgraded),
        UpgradeStatus::Rejected => Err(SocketError::AlreadyRejected),
    }
}

impl fmt::Debug for SocketUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketUpgrade")
            .field("status", &*self.status.lock())
            .field("state", &self.adapter.state())
            .finish()
    }
}

/// An accepted, bidirectional socket. Closes itself with `1000` when dropped.
pub struct WebSocket {
    adapter: Arc<dyn SocketAdapter>,
}

impl WebSocket {
    fn new(adapter: Arc<dyn SocketAdapter>) -> Self {
        Self { adapter }
    }

    /// Send a text (`String`, `&str`) or binary (`Bytes`, `Vec<u8>`) frame.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), SocketError> {
        self.adapter.send(message.into(), None)
    }

    pub fn send_timeout(
        &self,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<(), SocketError> {
        self.adapter.send(message.into(), Some(timeout))
    }

    /// Block until the next frame arrives.
    pub fn receive(&self) -> Result<Message, SocketError> {
        self.receive_inner(None)
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message, SocketError> {
        self.receive_inner(Some(timeout))
    }

    fn receive_inner(&self, timeout: Option<Duration>) -> Result<Message, SocketError> {
        match self.adapter.receive(timeout)? {
            InboundEvent::Message(message) => Ok(message),
            other => Err(SocketError::Protocol(format!(
                "unexpected websocket event {}",
                other.kind()
            ))),
        }
    }

    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<(), SocketError> {
        self.adapter.close(code, reason.map(str::to_owned))
    }

    pub fn state(&self) -> SessionState {
        self.adapter.state()
    }

    pub fn close_status(&self) -> Option<CloseStatus> {
        self.adapter.close_status()
    }

    /// Iterate over incoming frames until the peer disconnects.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming {
            socket: self,
            done: false,
        }
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        let _ = self.adapter.close(close_code::NORMAL, None);
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.adapter.state())
            .finish()
    }
}

impl<'a> IntoIterator for &'a WebSocket {
    type Item = Result<Message, SocketError>;
    type IntoIter = Incoming<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.incoming()
    }
}

/// Iterator over incoming frames. Ends on disconnect; any other error is
/// yielded once and ends the iteration.
pub struct Incoming<'a> {
    socket: &'a WebSocket,
    done: bool,
}

impl Iterator for Incoming<'_> {
    type Item = Result<Message, SocketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.socket.receive() {
            Ok(message) => Some(Ok(message)),
            Err(SocketError::Disconnected { .. }) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
