//! The handler chain: a chain-of-responsibility state machine.
//!
//! A chain runs four ordered handler lists against one context and one
//! in-progress response:
//!
//! 1. request handlers, while the chain is `Running`;
//! 2. exception handlers, for an error raised by a request handler;
//! 3. response handlers, unless the chain was terminated;
//! 4. finalizers, always.
//!
//! Handlers steer the chain with [`HandlerChain::stop`] (skip remaining
//! request handlers) and [`HandlerChain::terminate`] (also skip response
//! handlers). Only the first request-handler error changes control flow;
//! failures in exception handlers, response handlers and finalizers are
//! logged and otherwise ignored.

use std::sync::Arc;

use gantry_protocol::{Body, BoxError, Context, RequestContext, Response};
use http::StatusCode;
use tracing::{debug, warn};

use crate::handler::{ExceptionHandler, Handler};

/// Execution state of a chain. Starts `Running`; never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Running,
    /// No further request handlers run. Response handlers and finalizers do.
    Stopped,
    /// Only finalizers run.
    Terminated,
}

/// Behaviour switches for request-handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Stop the chain when a request handler fails.
    pub stop_on_error: bool,
    /// Return the request-handler error from [`HandlerChain::run`] once the
    /// exception handlers have seen it. Response handlers are skipped.
    pub raise_on_error: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            raise_on_error: false,
        }
    }
}

/// The four ordered handler lists a chain executes.
pub struct Handlers<C: Context = RequestContext> {
    pub(crate) request: Vec<Arc<dyn Handler<C>>>,
    pub(crate) response: Vec<Arc<dyn Handler<C>>>,
    pub(crate) exception: Vec<Arc<dyn ExceptionHandler<C>>>,
    pub(crate) finalizers: Vec<Arc<dyn Handler<C>>>,
}

impl<C: Context> Handlers<C> {
    pub fn new() -> Self {
        Self {
            request: Vec::new(),
            response: Vec::new(),
            exception: Vec::new(),
            finalizers: Vec::new(),
        }
    }

    pub fn add_request_handler<H: Handler<C>>(&mut self, handler: H) {
        self.request.push(Arc::new(handler));
    }

    pub fn add_response_handler<H: Handler<C>>(&mut self, handler: H) {
        self.response.push(Arc::new(handler));
    }

    pub fn add_exception_handler<H: ExceptionHandler<C>>(&mut self, handler: H) {
        self.exception.push(Arc::new(handler));
    }

    pub fn add_finalizer<H: Handler<C>>(&mut self, handler: H) {
        self.finalizers.push(Arc::new(handler));
    }

    /// Handler names per phase: request, response, exception, finalizer.
    pub fn names(&self) -> [Vec<&str>; 4] {
        [
            self.request.iter().map(|h| h.name()).collect(),
            self.response.iter().map(|h| h.name()).collect(),
            self.exception.iter().map(|h| h.name()).collect(),
            self.finalizers.iter().map(|h| h.name()).collect(),
        ]
    }
}

impl<C: Context> Default for Handlers<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> Clone for Handlers<C> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            response: self.response.clone(),
            exception: self.exception.clone(),
            finalizers: self.finalizers.clone(),
        }
    }
}

/// Per-request execution of a set of [`Handlers`].
///
/// A chain is single-use: build one per request, call [`run`](Self::run)
/// once, then inspect [`state`](Self::state) and [`error`](Self::error).
pub struct HandlerChain<'a, C: Context = RequestContext> {
    handlers: &'a Handlers<C>,
    options: ChainOptions,
    state: ChainState,
    /// First error raised by a request handler.
    error: Option<BoxError>,
    /// Error passed to `throw`, raised after the current handler returns.
    thrown: Option<BoxError>,
    finished: bool,
}

impl<'a, C: Context> HandlerChain<'a, C> {
    pub fn new(handlers: &'a Handlers<C>) -> Self {
        Self::with_options(handlers, ChainOptions::default())
    }

    pub fn with_options(handlers: &'a Handlers<C>, options: ChainOptions) -> Self {
        Self {
            handlers,
            options,
            state: ChainState::Running,
            error: None,
            thrown: None,
            finished: false,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state != ChainState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ChainState::Terminated
    }

    /// The first error raised by a request handler, if any.
    pub fn error(&self) -> Option<&BoxError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<BoxError> {
        self.error.take()
    }

    /// Skip the remaining request handlers and continue with the response
    /// handlers. Has no effect once the chain left `Running`.
    pub fn stop(&mut self) {
        if self.state == ChainState::Running {
            self.state = ChainState::Stopped;
        }
    }

    /// Skip the remaining request and response handlers. Finalizers still
    /// run.
    pub fn terminate(&mut self) {
        self.state = ChainState::Terminated;
    }

    /// Raise `error` from [`run`](Self::run) once the current request handler
    /// returns. Remaining request and response handlers are skipped and
    /// exception handlers are not consulted. No effect outside the request
    /// phase.
    pub fn throw(&mut self, error: impl Into<BoxError>) {
        self.thrown = Some(error.into());
    }

    /// Populate `response` and stop the chain.
    pub fn respond(&mut self, response: &mut Response, status: StatusCode, body: impl Into<Body>) {
        response.set_status(status);
        response.set_body(body);
        self.stop();
    }

    /// Run the chain against `context` and `response`.
    ///
    /// Only fails for an error passed to [`throw`](Self::throw), or for a
    /// request-handler error when `raise_on_error` is set. Finalizers run in
    /// every case.
    pub fn run(&mut self, context: &mut C, response: &mut Response) -> Result<(), BoxError> {
        if self.finished {
            warn!("handler chain already ran, ignoring second run");
            return Ok(());
        }
        self.finished = true;

        let handlers = self.handlers;
        let outcome = self.call_request_handlers(handlers, context, response);
        if outcome.is_ok() {
            self.call_response_handlers(handlers, context, response);
        }
        self.call_finalizers(handlers, context, response);
        outcome
    }

    fn call_request_handlers(
        &mut self,
        handlers: &'a Handlers<C>,
        context: &mut C,
        response: &mut Response,
    ) -> Result<(), BoxError> {
        for handler in &handlers.request {
            if self.state != ChainState::Running {
                break;
            }

            if let Err(error) = handler.handle(self, context, response) {
                debug!("request handler {} failed: {error}", handler.name());
                if self.options.stop_on_error {
                    self.stop();
                }
                self.call_exception_handlers(handlers, &error, context, response);
                if self.error.is_none() {
                    self.error = Some(error);
                }
                if self.options.raise_on_error {
                    if let Some(error) = self.error.take() {
                        return Err(error);
                    }
                }
            }

            if let Some(thrown) = self.thrown.take() {
                return Err(thrown);
            }
        }
        Ok(())
    }

    fn call_exception_handlers(
        &mut self,
        handlers: &'a Handlers<C>,
        error: &BoxError,
        context: &mut C,
        response: &mut Response,
    ) {
        for handler in &handlers.exception {
            if let Err(nested) = handler.handle(self, error, context, response) {
                warn!("exception while running exception handler {}: {nested}", handler.name());
            }
        }
    }

    fn call_response_handlers(
        &mut self,
        handlers: &'a Handlers<C>,
        context: &mut C,
        response: &mut Response,
    ) {
        for handler in &handlers.response {
            if self.state == ChainState::Terminated {
                return;
            }
            if let Err(error) = handler.handle(self, context, response) {
                warn!("exception while running response handler {}: {error}", handler.name());
            }
        }
    }

    fn call_finalizers(&mut self, handlers: &'a Handlers<C>, context: &mut C, response: &mut Response) {
        // A throw() from a finalizer has nowhere to go.
        self.thrown = None;
        for handler in &handlers.finalizers {
            if let Err(error) = handler.handle(self, context, response) {
                warn!("exception while running request finalizer {}: {error}", handler.name());
            }
        }
        self.thrown = None;
    }
}
