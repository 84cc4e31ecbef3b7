//! Inbound request representation.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;

use crate::socket::SocketUpgrade;

/// Pseudo HTTP method carried by socket-upgrade requests, so routing code can
/// treat upgrade routes like any other route.
pub const UPGRADE_METHOD: &str = "WEBSOCKET";

/// The `WEBSOCKET` pseudo-method as an [`http::Method`].
pub fn upgrade_method() -> Method {
    Method::from_bytes(UPGRADE_METHOD.as_bytes()).unwrap_or(Method::GET)
}

/// An inbound request. Immutable once handed to the gateway.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    scheme: String,
    remote_addr: Option<SocketAddr>,
    upgrade: Option<Arc<SocketUpgrade>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            scheme: "http".into(),
            remote_addr: None,
            upgrade: None,
        }
    }

    /// Build an upgrade request. The method is the `WEBSOCKET` pseudo-method
    /// and the scheme defaults to `ws`.
    pub fn websocket(path: impl Into<String>, upgrade: SocketUpgrade) -> Self {
        let mut request = Self::new(upgrade_method(), path);
        request.scheme = "ws".into();
        request.upgrade = Some(Arc::new(upgrade));
        request
    }

    /// Turn this request into an upgrade request carrying `upgrade`. The
    /// method becomes the `WEBSOCKET` pseudo-method; the scheme is kept.
    pub fn with_upgrade(mut self, upgrade: SocketUpgrade) -> Self {
        self.method = upgrade_method();
        self.upgrade = Some(Arc::new(upgrade));
        self
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of the named header, if it is valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// The upgrade handle of a socket-upgrade request.
    pub fn upgrade(&self) -> Option<&Arc<SocketUpgrade>> {
        self.upgrade.as_ref()
    }
}
