//! Synchronous transport adapter.
//!
//! One blocking call per request: the server in front hands over an
//! [`Environ`] and writes out the [`SyncResponse`] it gets back, on whatever
//! thread it runs requests on. The gateway is shared read-only between those
//! threads.

use std::fmt;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use gantry_gateway::Gateway;
use gantry_protocol::{Body, Context, Request};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Default limit for buffered request bodies: 2 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// A request as a blocking server sees it: raw strings and a body reader.
pub struct Environ {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header pairs in arrival order. Repeated names are kept.
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
    pub scheme: String,
    pub remote_addr: Option<SocketAddr>,
}

impl Environ {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: String::new(),
            headers: Vec::new(),
            body: Box::new(std::io::empty()),
            scheme: "http".into(),
            remote_addr: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Read + Send + 'static) -> Self {
        self.body = Box::new(body);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl fmt::Debug for Environ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("scheme", &self.scheme)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Status line, headers and a blocking body iterator.
pub struct SyncResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Box<dyn Iterator<Item = Bytes> + Send>,
}

impl SyncResponse {
    /// Body chunks, pulled on the caller's thread. Never yields empty chunks.
    pub fn into_body(self) -> Box<dyn Iterator<Item = Bytes> + Send> {
        self.body
    }

    /// Drain the body into one buffer.
    pub fn into_bytes(self) -> Bytes {
        Body::Stream(self.body).collect()
    }
}

impl fmt::Debug for SyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Drives a [`Gateway`] from a thread-per-request server.
pub struct SyncGateway<C: Context> {
    gateway: Arc<Gateway<C>>,
    max_body_size: usize,
}

impl<C: Context> SyncGateway<C> {
    pub fn new(gateway: Arc<Gateway<C>>) -> Self {
        Self {
            gateway,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway<C>> {
        &self.gateway
    }

    /// Serve one request on the calling thread.
    ///
    /// A body larger than the configured limit is answered with `413`
    /// without running the gateway.
    pub fn call(&self, environ: Environ) -> Result<SyncResponse, TransportError> {
        let Environ {
            method,
            path,
            query,
            headers,
            body,
            scheme,
            remote_addr,
        } = environ;

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| TransportError::InvalidRequest(format!("invalid method {method:?}")))?;
        let headers = parse_headers(headers)?;

        let limit = self.max_body_size;
        let mut buf = Vec::new();
        body.take((limit as u64).saturating_add(1)).read_to_end(&mut buf)?;
        if buf.len() > limit {
            warn!("request body for {path} exceeds {limit} bytes");
            return Ok(SyncResponse {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                headers: HeaderMap::new(),
                body: Box::new(std::iter::empty()),
            });
        }

        let mut request = Request::new(method, path)
            .with_query(query)
            .with_headers(headers)
            .with_scheme(scheme)
            .with_body(buf);
        if let Some(addr) = remote_addr {
            request = request.with_remote_addr(addr);
        }

        let response = self.gateway.handle(request);
        let (status, headers, body) = response.into_parts();
        let status = status.unwrap_or(StatusCode::OK);
        debug!("sync response {status}");
        Ok(SyncResponse {
            status,
            headers,
            body: body.into_chunks(),
        })
    }
}

impl<C: Context> Clone for SyncGateway<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            max_body_size: self.max_body_size,
        }
    }
}

fn parse_headers(pairs: Vec<(String, String)>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidRequest(format!("invalid header name {name:?}")))?;
        let header_value = HeaderValue::from_str(&value).map_err(|_| {
            TransportError::InvalidRequest(format!("invalid value for header {name}"))
        })?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}
