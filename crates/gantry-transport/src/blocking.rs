//! Keeps blocking gateway work off the event loop.

use std::sync::Arc;

use bytes::Bytes;
use gantry_gateway::Gateway;
use gantry_protocol::{Body, Context, Request, Response};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

/// Chunks buffered between a streaming body and the writer.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Run [`Gateway::handle`] on the blocking pool.
pub async fn dispatch<C: Context>(
    gateway: Arc<Gateway<C>>,
    request: Request,
) -> Result<Response, TransportError> {
    tokio::task::spawn_blocking(move || gateway.handle(request))
        .await
        .map_err(|e| TransportError::Worker(e.to_string()))
}

/// Turn a response body into a channel of chunks.
///
/// Streaming bodies are iterated on the blocking pool, so a slow producer
/// never stalls the loop. Empty chunks are skipped.
pub fn body_channel(body: Body) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    match body {
        Body::Empty => {}
        Body::Bytes(bytes) => {
            if !bytes.is_empty() {
                // Fresh channel with spare capacity.
                let _ = tx.try_send(bytes);
            }
        }
        Body::Stream(chunks) => {
            tokio::task::spawn_blocking(move || {
                for chunk in chunks.filter(|c| !c.is_empty()) {
                    if tx.blocking_send(chunk).is_err() {
                        debug!("response body receiver went away, dropping the rest");
                        break;
                    }
                }
            });
        }
    }
    rx
}
