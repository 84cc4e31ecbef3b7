//! Transport-level failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed input from the server in front of the adapter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unexpected {received} event, expected {expected}")]
    UnexpectedEvent {
        expected: &'static str,
        received: &'static str,
    },

    /// The blocking worker running the gateway panicked or was cancelled.
    #[error("gateway worker failed: {0}")]
    Worker(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    ConnectionClosed,
}
