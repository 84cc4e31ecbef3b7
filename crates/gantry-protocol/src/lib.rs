//! Gantry protocol types.
//!
//! Plain data shared by every other crate in the workspace: the inbound
//! [`Request`], the in-progress [`Response`], the per-request property bag
//! ([`RequestContext`]), the error taxonomy, and the socket surface that
//! blocking handler code uses once a connection has been upgraded.
//!
//! Nothing in here knows about an async runtime. The socket types talk to a
//! [`SocketAdapter`], which the transport layer implements on top of its
//! event loop.

pub mod context;
pub mod error;
pub mod request;
pub mod response;
pub mod socket;

pub use context::{Context, RequestContext};
pub use error::{BoxError, HttpError, SocketError};
pub use request::{Request, UPGRADE_METHOD, upgrade_method};
pub use response::{Body, Rejection, Response};
pub use socket::{
    CloseStatus, Incoming, InboundEvent, Message, OutboundEvent, SessionState, SocketAdapter,
    SocketUpgrade, WebSocket, close_code,
};
