//! Gateway: builds a context and a handler chain for every request.

use std::sync::Arc;

use gantry_protocol::{BoxError, Context, Request, RequestContext, Response};
use http::StatusCode;
use tracing::{debug, error, warn};

use crate::chain::{ChainOptions, HandlerChain, Handlers};
use crate::handler::{
    ExceptionHandler, Handler, HandlerResult, exception_handler_fn, handler_fn,
};

/// Creates the per-request context from the inbound request.
pub type ContextFactory<C> = Arc<dyn Fn(Request) -> C + Send + Sync>;

/// An immutable set of handlers plus a context factory.
///
/// All per-request state lives in the context, the chain and the response,
/// so a gateway can be shared (`Arc<Gateway>`) and invoked from any number
/// of threads at once. Registering another handler means building a new
/// gateway.
pub struct Gateway<C: Context = RequestContext> {
    handlers: Handlers<C>,
    options: ChainOptions,
    context_factory: ContextFactory<C>,
}

impl Gateway<RequestContext> {
    /// A builder for a gateway using the default [`RequestContext`].
    pub fn builder() -> GatewayBuilder<RequestContext> {
        GatewayBuilder::with_context_factory(RequestContext::new)
    }
}

impl<C: Context> Gateway<C> {
    pub fn handlers(&self) -> &Handlers<C> {
        &self.handlers
    }

    pub fn options(&self) -> ChainOptions {
        self.options
    }

    /// A fresh chain bound to this gateway's handlers.
    pub fn new_chain(&self) -> HandlerChain<'_, C> {
        HandlerChain::with_options(&self.handlers, self.options)
    }

    pub fn new_context(&self, request: Request) -> C {
        (self.context_factory)(request)
    }

    /// Run `request` through a new chain, populating `response`.
    ///
    /// Fails only when the chain raises (see [`HandlerChain::run`]).
    pub fn process(&self, request: Request, response: &mut Response) -> Result<(), BoxError> {
        self.run_chain(request, response).map(|_| ())
    }

    /// Returns whether a request-handler error was recorded.
    fn run_chain(&self, request: Request, response: &mut Response) -> Result<bool, BoxError> {
        debug!("{} {}", request.method(), request.path());
        let mut context = self.new_context(request);
        let mut chain = self.new_chain();
        chain.run(&mut context, response)?;
        Ok(chain.error().is_some())
    }

    /// Handle a request and return the response ready to be written out.
    ///
    /// A response nobody gave a status becomes `500` if a request handler
    /// failed without any handler dealing with it, and `200` otherwise.
    pub fn handle(&self, request: Request) -> Response {
        let mut response = Response::new();
        let failed = match self.run_chain(request, &mut response) {
            Ok(failed) => failed,
            Err(e) => {
                error!("unhandled error in handler chain: {e}");
                true
            }
        };

        if response.status().is_none() {
            if failed {
                internal_error(&mut response);
            } else {
                response.set_status(StatusCode::OK);
            }
        }
        response
    }

    /// Handle a socket-upgrade request.
    ///
    /// The chain starts with a `101 Switching Protocols` response. If the
    /// handlers change that status without accepting or rejecting the
    /// upgrade themselves, the upgrade is rejected with their response. An
    /// upgrade nobody touched is closed.
    pub fn accept(&self, request: Request) {
        let Some(upgrade) = request.upgrade().cloned() else {
            warn!("accept called for a request without upgrade: {}", request.path());
            return;
        };

        let mut response = Response::with_status(StatusCode::SWITCHING_PROTOCOLS);
        let failed = match self.run_chain(request, &mut response) {
            Ok(failed) => failed,
            Err(e) => {
                error!("unhandled error in upgrade handler chain: {e}");
                true
            }
        };

        if upgrade.is_upgraded() || upgrade.is_rejected() {
            return;
        }

        if failed && response.status() == Some(StatusCode::SWITCHING_PROTOCOLS) {
            internal_error(&mut response);
        }

        if response.status() != Some(StatusCode::SWITCHING_PROTOCOLS) {
            if let Err(e) = upgrade.reject(response) {
                warn!("failed to reject websocket upgrade: {e}");
            }
            return;
        }

        if let Err(e) = upgrade.close() {
            debug!("failed to close unhandled websocket upgrade: {e}");
        }
    }
}

fn internal_error(response: &mut Response) {
    response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    if response.body().is_empty() {
        response.set_text("Internal Server Error");
    }
}

/// Collects handlers and options, then freezes them into a [`Gateway`].
pub struct GatewayBuilder<C: Context> {
    handlers: Handlers<C>,
    options: ChainOptions,
    context_factory: ContextFactory<C>,
}

impl<C: Context> GatewayBuilder<C> {
    /// Start a builder whose gateway creates contexts with `factory`.
    pub fn with_context_factory<F>(factory: F) -> Self
    where
        F: Fn(Request) -> C + Send + Sync + 'static,
    {
        Self {
            handlers: Handlers::new(),
            options: ChainOptions::default(),
            context_factory: Arc::new(factory),
        }
    }

    pub fn request_handler<H: Handler<C>>(mut self, handler: H) -> Self {
        self.handlers.add_request_handler(handler);
        self
    }

    pub fn response_handler<H: Handler<C>>(mut self, handler: H) -> Self {
        self.handlers.add_response_handler(handler);
        self
    }

    pub fn exception_handler<H: ExceptionHandler<C>>(mut self, handler: H) -> Self {
        self.handlers.add_exception_handler(handler);
        self
    }

    pub fn finalizer<H: Handler<C>>(mut self, handler: H) -> Self {
        self.handlers.add_finalizer(handler);
        self
    }

    pub fn request_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut HandlerChain<'_, C>, &mut C, &mut Response) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.request_handler(handler_fn(f))
    }

    pub fn response_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut HandlerChain<'_, C>, &mut C, &mut Response) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.response_handler(handler_fn(f))
    }

    pub fn exception_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut HandlerChain<'_, C>, &BoxError, &mut C, &mut Response) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.exception_handler(exception_handler_fn(f))
    }

    pub fn finalizer_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut HandlerChain<'_, C>, &mut C, &mut Response) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.finalizer(handler_fn(f))
    }

    pub fn options(mut self, options: ChainOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Gateway<C> {
        Gateway {
            handlers: self.handlers,
            options: self.options,
            context_factory: self.context_factory,
        }
    }
}

impl<C: Context> From<Gateway<C>> for GatewayBuilder<C> {
    /// Reopen a gateway's configuration, e.g. to register a late handler.
    fn from(gateway: Gateway<C>) -> Self {
        Self {
            handlers: gateway.handlers,
            options: gateway.options,
            context_factory: gateway.context_factory,
        }
    }
}

impl<C: Context> Clone for Gateway<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            options: self.options,
            context_factory: self.context_factory.clone(),
        }
    }
}
