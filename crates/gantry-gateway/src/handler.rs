//! Handler capabilities, one per chain phase.
//!
//! Request, response and finalizer handlers share the [`Handler`] signature;
//! exception handlers additionally receive the error raised by a request
//! handler. Handlers are stored as trait objects and resolved when they are
//! registered, so structs and closures (through [`handler_fn`] and
//! [`exception_handler_fn`]) can be mixed freely.

use gantry_protocol::{BoxError, Context, RequestContext, Response};

use crate::chain::HandlerChain;

/// Result of a single handler invocation.
pub type HandlerResult = Result<(), BoxError>;

/// A request handler, response handler or finalizer.
pub trait Handler<C: Context = RequestContext>: Send + Sync + 'static {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult;

    /// Handler name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Invoked with the error raised by a request handler.
pub trait ExceptionHandler<C: Context = RequestContext>: Send + Sync + 'static {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        error: &BoxError,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult;

    /// Handler name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A [`Handler`] backed by a closure. Created with [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt a closure into a [`Handler`].
pub fn handler_fn<C, F>(f: F) -> HandlerFn<F>
where
    C: Context,
    F: Fn(&mut HandlerChain<'_, C>, &mut C, &mut Response) -> HandlerResult
        + Send
        + Sync
        + 'static,
{
    HandlerFn { f }
}

impl<C, F> Handler<C> for HandlerFn<F>
where
    C: Context,
    F: Fn(&mut HandlerChain<'_, C>, &mut C, &mut Response) -> HandlerResult
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        (self.f)(chain, context, response)
    }
}

/// An [`ExceptionHandler`] backed by a closure. Created with
/// [`exception_handler_fn`].
#[derive(Clone)]
pub struct ExceptionHandlerFn<F> {
    f: F,
}

/// Adapt a closure into an [`ExceptionHandler`].
pub fn exception_handler_fn<C, F>(f: F) -> ExceptionHandlerFn<F>
where
    C: Context,
    F: Fn(&mut HandlerChain<'_, C>, &BoxError, &mut C, &mut Response) -> HandlerResult
        + Send
        + Sync
        + 'static,
{
    ExceptionHandlerFn { f }
}

impl<C, F> ExceptionHandler<C> for ExceptionHandlerFn<F>
where
    C: Context,
    F: Fn(&mut HandlerChain<'_, C>, &BoxError, &mut C, &mut Response) -> HandlerResult
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        error: &BoxError,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        (self.f)(chain, error, context, response)
    }
}
