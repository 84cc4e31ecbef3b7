//! Gantry Gateway: handler chains for blocking request processing.
//!
//! The gateway owns four ordered handler lists (request, response,
//! exception, finalizer) and, for every inbound request, builds a fresh
//! context and [`HandlerChain`] to run them. It is transport-agnostic: the
//! transport crate drives it from blocking threads or from an event loop.

pub mod chain;
pub mod gateway;
pub mod handler;
pub mod handlers;

pub use chain::{ChainOptions, ChainState, HandlerChain, Handlers};
pub use gateway::{ContextFactory, Gateway, GatewayBuilder};
pub use handler::{
    ExceptionHandler, ExceptionHandlerFn, Handler, HandlerFn, HandlerResult,
    exception_handler_fn, handler_fn,
};
pub use handlers::{
    CompositeExceptionHandler, CompositeFinalizer, CompositeHandler, EmptyResponseHandler,
    ErrorFormat, HttpErrorHandler,
};
