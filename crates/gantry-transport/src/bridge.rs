//! Sync/async bridge for upgraded connections.
//!
//! Every upgrade gets a [`SocketSession`] and one dedicated blocking worker
//! that runs [`Gateway::accept`]. The handler code in that worker talks to the
//! session with blocking calls, while the event loop moves frames between the
//! session channels and the real transport:
//!
//! ```text
//!   transport ──FrameSource──▶ pump ──inbound──▶ worker (blocking handler)
//!   transport ◀──FrameSink──── pump ◀─outbound── worker
//! ```
//!
//! The pump never blocks on a full inbound channel: a frame that does not fit
//! is held back until a permit is reserved, and outbound commands keep
//! flowing meanwhile.

use std::future::Future;
use std::sync::Arc;

use gantry_gateway::Gateway;
use gantry_protocol::{
    Context, InboundEvent, Message, OutboundEvent, Rejection, Request, SocketAdapter,
    SocketUpgrade, close_code,
};
use http::HeaderMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::session::{self, DEFAULT_CHANNEL_CAPACITY, LoopEnd};

/// What the transport reads from an upgraded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Message(Message),
    /// The peer sent a close frame. The pump answers it before finishing.
    Close { code: u16, reason: Option<String> },
    /// The connection ended without a close handshake.
    Disconnected { code: u16 },
}

/// Inbound half of an upgraded transport connection.
///
/// `next_frame` must be cancel-safe: the pump drops it whenever an outbound
/// command is ready first.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> impl Future<Output = SourceEvent> + Send;
}

/// Outbound half of an upgraded transport connection.
pub trait FrameSink: Send {
    fn send_frame(&mut self, message: Message)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(
        &mut self,
        code: u16,
        reason: Option<String>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Outcome of the upgrade handshake: the first command of the worker.
#[derive(Debug)]
pub enum Handshake {
    Accepted(Connection),
    Rejected(Rejection),
    /// The handlers closed the connection without accepting it.
    Closed { code: u16, reason: Option<String> },
}

/// Starts sessions and their workers for one gateway.
pub struct Bridge<C: Context> {
    gateway: Arc<Gateway<C>>,
    capacity: usize,
}

impl<C: Context> Bridge<C> {
    pub fn new(gateway: Arc<Gateway<C>>) -> Self {
        Self::with_capacity(gateway, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(gateway: Arc<Gateway<C>>, capacity: usize) -> Self {
        Self { gateway, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run the upgrade `request` through the gateway on a blocking worker and
    /// wait for its answer to the handshake.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self, request: Request) -> Handshake {
        let id = Uuid::new_v4();
        let (session, mut loop_end) = session::channel(self.capacity, Handle::current());
        let session = Arc::new(session);

        // Always the first event; the channel is fresh so it cannot be full.
        if loop_end.inbound.try_send(InboundEvent::Connect).is_err() {
            error!("socket {id}: failed to queue connect event");
        }

        let adapter: Arc<dyn SocketAdapter> = session.clone();
        let request = request.with_upgrade(SocketUpgrade::new(adapter));
        let path = request.path().to_owned();
        debug!("socket {id}: upgrade {path}");

        let gateway = self.gateway.clone();
        let worker = tokio::task::spawn_blocking(move || {
            gateway.accept(request);
            if let Err(e) = session.close(close_code::NORMAL, None) {
                debug!("socket {id}: close after handler returned failed: {e}");
            }
        });

        match loop_end.next_command().await {
            Some(OutboundEvent::Accept {
                subprotocol,
                headers,
            }) => {
                debug!("socket {id}: accepted");
                Handshake::Accepted(Connection {
                    id,
                    subprotocol,
                    headers,
                    loop_end,
                    worker,
                })
            }
            Some(OutboundEvent::Reject(rejection)) => {
                debug!("socket {id}: rejected with {}", rejection.status);
                watch_worker(id, worker);
                Handshake::Rejected(rejection)
            }
            Some(OutboundEvent::Close { code, reason }) => {
                debug!("socket {id}: closed before accept code={code}");
                watch_worker(id, worker);
                Handshake::Closed { code, reason }
            }
            Some(OutboundEvent::Message(_)) => {
                warn!("socket {id}: message before accept");
                watch_worker(id, worker);
                Handshake::Closed {
                    code: close_code::INTERNAL_ERROR,
                    reason: None,
                }
            }
            None => {
                error!("socket {id}: worker for {path} ended without answering the upgrade");
                watch_worker(id, worker);
                Handshake::Closed {
                    code: close_code::INTERNAL_ERROR,
                    reason: None,
                }
            }
        }
    }
}

impl<C: Context> Clone for Bridge<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            capacity: self.capacity,
        }
    }
}

fn watch_worker(id: Uuid, worker: JoinHandle<()>) {
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!("socket {id}: worker failed: {e}");
        }
    });
}

/// An accepted connection, ready to be pumped.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    subprotocol: Option<String>,
    headers: HeaderMap,
    loop_end: LoopEnd,
    worker: JoinHandle<()>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subprotocol chosen by the handler.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Extra headers for the switching-protocols response.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Move frames between the transport and the worker until either side
    /// closes, then wait for the worker to finish.
    pub async fn run<S: FrameSource, K: FrameSink>(self, mut source: S, mut sink: K) {
        let Connection {
            id,
            loop_end,
            worker,
            ..
        } = self;
        let LoopEnd {
            inbound,
            mut outbound,
            status,
        } = loop_end;

        let mut pending: Option<InboundEvent> = None;
        let (code, reason) = loop {
            tokio::select! {
                frame = source.next_frame(), if pending.is_none() => match frame {
                    SourceEvent::Message(message) => {
                        pending = Some(InboundEvent::Message(message));
                    }
                    SourceEvent::Close { code, reason } => {
                        debug!("socket {id}: peer closed code={code}");
                        let reply = match code {
                            close_code::NO_STATUS => close_code::NORMAL,
                            code => code,
                        };
                        if let Err(e) = sink.close(reply, None).await {
                            debug!("socket {id}: close reply not written: {e}");
                        }
                        break (code, reason);
                    }
                    SourceEvent::Disconnected { code } => {
                        debug!("socket {id}: peer disconnected code={code}");
                        break (code, None);
                    }
                },

                permit = inbound.reserve(), if pending.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(event) = pending.take() {
                            permit.send(event);
                        }
                    }
                    Err(_) => {
                        // The worker is done and dropped its session.
                        pending = None;
                    }
                },

                command = outbound.recv() => match command {
                    Some(OutboundEvent::Message(message)) => {
                        if let Err(e) = sink.send_frame(message).await {
                            warn!("socket {id}: write failed: {e}");
                            break (close_code::ABNORMAL, None);
                        }
                    }
                    Some(OutboundEvent::Close { code, reason }) => {
                        debug!("socket {id}: closing code={code}");
                        if let Err(e) = sink.close(code, reason.clone()).await {
                            debug!("socket {id}: close frame not written: {e}");
                        }
                        break (code, reason);
                    }
                    Some(other) => {
                        warn!("socket {id}: ignoring {other:?} after the handshake");
                    }
                    None => {
                        // Worker finished; its session always closes on the
                        // way out, so this only happens if it panicked.
                        if let Err(e) = sink.close(close_code::INTERNAL_ERROR, None).await {
                            debug!("socket {id}: close frame not written: {e}");
                        }
                        break (close_code::INTERNAL_ERROR, None);
                    }
                },
            }
        };

        session::finish(&status, code, reason);
        outbound.close();
        drop(outbound);
        deliver_disconnect(inbound, pending, code);

        if let Err(e) = worker.await {
            error!("socket {id}: worker failed: {e}");
        }
        debug!("socket {id}: finished");
    }
}

/// Deliver a held-back frame and the disconnect sentinel without blocking
/// the caller. The worker may be busy and the inbound channel full.
fn deliver_disconnect(
    inbound: mpsc::Sender<InboundEvent>,
    pending: Option<InboundEvent>,
    code: u16,
) {
    tokio::spawn(async move {
        if let Some(event) = pending {
            if inbound.send(event).await.is_err() {
                return;
            }
        }
        let _ = inbound.send(InboundEvent::Disconnect { code }).await;
    });
}
