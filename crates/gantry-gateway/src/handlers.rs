//! Reusable handlers: composites that group handlers into one list entry,
//! plus a few common response and exception handlers.

use std::sync::Arc;

use gantry_protocol::{Body, BoxError, Context, HttpError, Response};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use tracing::warn;

use crate::chain::HandlerChain;
use crate::handler::{ExceptionHandler, Handler, HandlerResult};

/// Runs a list of handlers as one handler: a stripped-down chain.
///
/// Returns as soon as the chain is terminated, and, when `return_on_stop` is
/// set, as soon as it is stopped. An error from an inner handler propagates
/// to the enclosing chain.
pub struct CompositeHandler<C: Context> {
    handlers: Vec<Arc<dyn Handler<C>>>,
    return_on_stop: bool,
}

impl<C: Context> CompositeHandler<C> {
    /// A composite for the request phase: respects `stop()`.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            return_on_stop: true,
        }
    }

    /// A composite for the response phase: keeps going after `stop()`, the
    /// way the chain itself runs response handlers.
    pub fn for_responses() -> Self {
        Self {
            handlers: Vec::new(),
            return_on_stop: false,
        }
    }

    pub fn with_return_on_stop(mut self, return_on_stop: bool) -> Self {
        self.return_on_stop = return_on_stop;
        self
    }

    pub fn append<H: Handler<C>>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn append_shared(&mut self, handler: Arc<dyn Handler<C>>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// Remove a previously appended shared handler.
    pub fn remove(&mut self, handler: &Arc<dyn Handler<C>>) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        self.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Context> Default for CompositeHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> Handler<C> for CompositeHandler<C> {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        for handler in &self.handlers {
            handler.handle(chain, context, response)?;

            if chain.is_terminated() {
                return Ok(());
            }
            if chain.is_stopped() && self.return_on_stop {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Runs every inner exception handler; failures are logged.
pub struct CompositeExceptionHandler<C: Context> {
    handlers: Vec<Arc<dyn ExceptionHandler<C>>>,
}

impl<C: Context> CompositeExceptionHandler<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn append<H: ExceptionHandler<C>>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Context> Default for CompositeExceptionHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> ExceptionHandler<C> for CompositeExceptionHandler<C> {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        error: &BoxError,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        for handler in &self.handlers {
            if let Err(nested) = handler.handle(chain, error, context, response) {
                warn!("exception while running exception handler {}: {nested}", handler.name());
            }
        }
        Ok(())
    }
}

/// Runs every inner handler regardless of chain state or failures.
pub struct CompositeFinalizer<C: Context> {
    handlers: Vec<Arc<dyn Handler<C>>>,
}

impl<C: Context> CompositeFinalizer<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn append<H: Handler<C>>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Context> Default for CompositeFinalizer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> Handler<C> for CompositeFinalizer<C> {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        for handler in &self.handlers {
            if let Err(error) = handler.handle(chain, context, response) {
                warn!("error while running request finalizer {}: {error}", handler.name());
            }
        }
        Ok(())
    }
}

/// Response handler that fills in a default response when no handler set a
/// status or a body.
#[derive(Debug, Clone)]
pub struct EmptyResponseHandler {
    status: StatusCode,
    body: Vec<u8>,
    headers: HeaderMap,
}

impl EmptyResponseHandler {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn populate_default_response(&self, response: &mut Response) {
        response.set_status(self.status);
        if !self.body.is_empty() {
            response.set_body(Body::from(self.body.clone()));
        }
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

impl Default for EmptyResponseHandler {
    /// `404 Not Found` with an empty body.
    fn default() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }
}

impl<C: Context> Handler<C> for EmptyResponseHandler {
    fn handle(
        &self,
        _chain: &mut HandlerChain<'_, C>,
        _context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        if response.is_empty() {
            self.populate_default_response(response);
        }
        Ok(())
    }
}

/// How [`HttpErrorHandler`] renders errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorFormat {
    /// `{"code": 404, "description": "..."}`
    #[default]
    Json,
    Text,
}

/// Exception handler that turns an [`HttpError`] into a response and stops
/// the chain. Other errors are left alone for later exception handlers.
#[derive(Debug, Clone, Default)]
pub struct HttpErrorHandler {
    format: ErrorFormat,
}

impl HttpErrorHandler {
    pub fn new(format: ErrorFormat) -> Self {
        Self { format }
    }
}

impl<C: Context> ExceptionHandler<C> for HttpErrorHandler {
    fn handle(
        &self,
        chain: &mut HandlerChain<'_, C>,
        error: &BoxError,
        _context: &mut C,
        response: &mut Response,
    ) -> HandlerResult {
        let Some(http_error) = error.downcast_ref::<HttpError>() else {
            return Ok(());
        };

        response.set_status(http_error.status);
        match self.format {
            ErrorFormat::Json => response.set_json(&json!({
                "code": http_error.code(),
                "description": http_error.description,
            }))?,
            ErrorFormat::Text => response.set_text(http_error.description.clone()),
        }
        chain.stop();
        Ok(())
    }
}
