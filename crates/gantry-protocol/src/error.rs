//! Error types shared across the gateway.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Boxed error returned by handlers. Anything that implements
/// `std::error::Error` can be raised from a handler with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error that maps directly onto an HTTP status.
///
/// Request handlers raise it to abort with a specific status; the
/// `HttpErrorHandler` exception handler recognizes it and renders it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} {}", status.as_u16(), description)]
pub struct HttpError {
    pub status: StatusCode,
    pub description: String,
}

impl HttpError {
    pub fn new(status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }

    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, description)
    }

    pub fn forbidden(description: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, description)
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("Not found: {path}"))
    }

    pub fn method_not_allowed(method: &http::Method) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method not allowed: {method}"),
        )
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, description)
    }

    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }
}

/// Failures surfaced by the blocking socket surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The peer or the transport went away. Every later `receive` reports the
    /// same code.
    #[error("websocket disconnected code={code}")]
    Disconnected { code: u16 },

    /// The local side already started closing the session.
    #[error("websocket is closed")]
    Closed,

    /// Frames can only be exchanged after the upgrade was accepted.
    #[error("websocket upgrade has not been accepted")]
    NotAccepted,

    #[error("websocket connection already upgraded")]
    AlreadyUpgraded,

    #[error("websocket connection already rejected")]
    AlreadyRejected,

    /// The application and the transport disagree about the event sequence.
    #[error("websocket protocol error: {0}")]
    Protocol(String),

    #[error("websocket operation timed out after {0:?}")]
    Timeout(Duration),
}

impl SocketError {
    /// Whether the error means the connection can no longer carry frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Closed)
    }
}
