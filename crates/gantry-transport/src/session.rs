//! Socket session: the blocking half of an upgraded connection.
//!
//! A session owns the worker ends of two bounded channels. `inbound` carries
//! frames from the event loop to the worker, `outbound` carries commands the
//! other way. The worker blocks on them through the runtime [`Handle`]; the
//! event loop only ever awaits them. Besides the channels the two sides share
//! one small status record, which the loop updates once the transport is gone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gantry_protocol::{
    CloseStatus, InboundEvent, Message, OutboundEvent, Rejection, SessionState, SocketAdapter,
    SocketError, close_code,
};
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

/// Default capacity of both session channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Create a session and the event-loop end of its channels.
///
/// A capacity of `0` is raised to `1`.
pub fn channel(capacity: usize, runtime: Handle) -> (SocketSession, LoopEnd) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let status = Arc::new(Mutex::new(Status {
        state: SessionState::Connecting,
        disconnect: None,
        finished: None,
        close: None,
        closed_locally: false,
    }));

    let session = SocketSession {
        inbound: Mutex::new(inbound_rx),
        outbound: outbound_tx,
        status: status.clone(),
        runtime,
    };
    let loop_end = LoopEnd {
        inbound: inbound_tx,
        outbound: outbound_rx,
        status,
    };
    (session, loop_end)
}

#[derive(Debug)]
pub(crate) struct Status {
    state: SessionState,
    /// Code carried by the disconnect sentinel, once it was received.
    disconnect: Option<u16>,
    /// Code the event loop finished with, once the transport is gone.
    finished: Option<u16>,
    close: Option<CloseStatus>,
    closed_locally: bool,
}

impl Status {
    /// Code to report for a transport that is gone.
    fn lost_code(&self) -> u16 {
        self.disconnect
            .or(self.finished)
            .unwrap_or(close_code::ABNORMAL)
    }
}

/// Record that the transport behind a session is gone. The first close
/// status wins, and the session is `Closed` from here on.
pub(crate) fn finish(status: &Mutex<Status>, code: u16, reason: Option<String>) {
    let mut status = status.lock();
    status.finished.get_or_insert(code);
    status.close.get_or_insert(CloseStatus { code, reason });
    status.state = SessionState::Closed;
}

/// Blocking [`SocketAdapter`] over the session channels.
///
/// Must only be used from blocking threads (e.g. `spawn_blocking`), never
/// from inside an async task.
pub struct SocketSession {
    inbound: Mutex<mpsc::Receiver<InboundEvent>>,
    outbound: mpsc::Sender<OutboundEvent>,
    status: Arc<Mutex<Status>>,
    runtime: Handle,
}

impl SocketSession {
    fn block_on<F: Future>(
        &self,
        timeout: Option<Duration>,
        future: F,
    ) -> Result<F::Output, SocketError> {
        match timeout {
            None => Ok(self.runtime.block_on(future)),
            Some(limit) => self
                .runtime
                .block_on(async { tokio::time::timeout(limit, future).await })
                .map_err(|_| SocketError::Timeout(limit)),
        }
    }

    /// Record the disconnect sentinel. The first code wins.
    fn disconnected(&self, code: u16) -> SocketError {
        let mut status = self.status.lock();
        let code = *status.disconnect.get_or_insert(code);
        status.close.get_or_insert(CloseStatus { code, reason: None });
        status.state = SessionState::Closed;
        SocketError::Disconnected { code }
    }

    fn push(&self, event: OutboundEvent, timeout: Option<Duration>) -> Result<(), SocketError> {
        match self.block_on(timeout, self.outbound.send(event))? {
            Ok(()) => Ok(()),
            Err(_) => {
                // The event loop dropped its end: the transport is gone.
                let mut status = self.status.lock();
                status.state = SessionState::Closed;
                Err(SocketError::Disconnected {
                    code: status.lost_code(),
                })
            }
        }
    }

    fn expect_connecting(&self, operation: &str) -> Result<(), SocketError> {
        let state = self.status.lock().state;
        match state {
            SessionState::Connecting => Ok(()),
            SessionState::Closed => Err(SocketError::Closed),
            other => Err(SocketError::Protocol(format!(
                "cannot {operation} a session that is {other}"
            ))),
        }
    }
}

impl SocketAdapter for SocketSession {
    fn receive(&self, timeout: Option<Duration>) -> Result<InboundEvent, SocketError> {
        if let Some(code) = self.status.lock().disconnect {
            return Err(SocketError::Disconnected { code });
        }

        let mut inbound = self.inbound.lock();
        // Another thread may have consumed the sentinel while we waited.
        if let Some(code) = self.status.lock().disconnect {
            return Err(SocketError::Disconnected { code });
        }

        match self.block_on(timeout, inbound.recv())? {
            Some(InboundEvent::Disconnect { code }) => Err(self.disconnected(code)),
            Some(event) => Ok(event),
            None => Err(self.disconnected(close_code::ABNORMAL)),
        }
    }

    fn send(&self, message: Message, timeout: Option<Duration>) -> Result<(), SocketError> {
        {
            let status = self.status.lock();
            match status.state {
                SessionState::Open => {}
                SessionState::Connecting => return Err(SocketError::NotAccepted),
                SessionState::Closing => return Err(SocketError::Closed),
                SessionState::Closed if status.closed_locally => {
                    return Err(SocketError::Closed);
                }
                SessionState::Closed => {
                    return Err(match status.disconnect.or(status.finished) {
                        Some(code) => SocketError::Disconnected { code },
                        None => SocketError::Closed,
                    });
                }
            }
        }
        self.push(OutboundEvent::Message(message), timeout)
    }

    fn accept(&self, subprotocol: Option<String>, headers: HeaderMap) -> Result<(), SocketError> {
        self.expect_connecting("accept")?;
        self.push(
            OutboundEvent::Accept {
                subprotocol,
                headers,
            },
            None,
        )?;
        self.status.lock().state = SessionState::Open;
        Ok(())
    }

    fn reject(&self, rejection: Rejection) -> Result<(), SocketError> {
        self.expect_connecting("reject")?;
        self.status.lock().state = SessionState::Closed;
        self.push(OutboundEvent::Reject(rejection), None)
    }

    fn close(&self, code: u16, reason: Option<String>) -> Result<(), SocketError> {
        {
            let mut status = self.status.lock();
            status.state = match status.state {
                SessionState::Connecting => SessionState::Closed,
                SessionState::Open => SessionState::Closing,
                SessionState::Closing | SessionState::Closed => return Ok(()),
            };
            status.closed_locally = true;
            status.close = Some(CloseStatus {
                code,
                reason: reason.clone(),
            });
        }

        if let Err(e) = self.push(OutboundEvent::Close { code, reason }, None) {
            debug!("close on a session whose transport is gone: {e}");
        }
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.status.lock().state
    }

    fn close_status(&self) -> Option<CloseStatus> {
        self.status.lock().close.clone()
    }
}

impl fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSession")
            .field("status", &*self.status.lock())
            .finish()
    }
}

/// The event-loop end of a session's channels.
#[derive(Debug)]
pub struct LoopEnd {
    pub(crate) inbound: mpsc::Sender<InboundEvent>,
    pub(crate) outbound: mpsc::Receiver<OutboundEvent>,
    pub(crate) status: Arc<Mutex<Status>>,
}

impl LoopEnd {
    /// Queue an inbound event for the worker. Returns `false` once the
    /// worker dropped its session.
    pub async fn deliver(&self, event: InboundEvent) -> bool {
        self.inbound.send(event).await.is_ok()
    }

    /// Next command from the worker. `None` once the worker dropped its
    /// session and every queued command was taken.
    pub async fn next_command(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }

    /// Refuse further commands from the worker. Commands already queued can
    /// still be taken.
    pub fn close_commands(&mut self) {
        self.outbound.close();
    }

    /// Mark the transport as gone with the given close code and reason.
    /// The worker still receives whatever is queued before the sentinel.
    pub fn finish(&self, code: u16, reason: Option<String>) {
        finish(&self.status, code, reason);
    }
}
