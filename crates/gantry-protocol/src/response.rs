//! The response that handlers populate while a chain runs.

use std::fmt;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::Serialize;

/// Response body: nothing, a single buffer, or a lazy producer of chunks.
///
/// A streaming body is pulled by the transport adapter after the chain has
/// finished, so the producer may block.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(Box<dyn Iterator<Item = Bytes> + Send + 'static>),
}

impl Body {
    pub fn stream<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(Box::new(chunks.into_iter()))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Stream(_) => false,
        }
    }

    /// Drain the body into one buffer. Blocks for as long as a streaming
    /// producer does.
    pub fn collect(self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Bytes(b) => b,
            Self::Stream(chunks) => {
                let mut buf = BytesMut::new();
                for chunk in chunks {
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Turn the body into an iterator of chunks, skipping empty ones.
    pub fn into_chunks(self) -> Box<dyn Iterator<Item = Bytes> + Send + 'static> {
        match self {
            Self::Empty => Box::new(std::iter::empty()),
            Self::Bytes(b) if b.is_empty() => Box::new(std::iter::empty()),
            Self::Bytes(b) => Box::new(std::iter::once(b)),
            Self::Stream(chunks) => Box::new(chunks.filter(|c| !c.is_empty())),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

/// The in-progress response. Starts empty: no status and no body.
#[derive(Debug, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut response = Self::with_status(status);
        response.set_text(text);
        response
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Set a UTF-8 text body and a matching content type.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = Body::from(text.into());
    }

    /// Serialize `value` as the JSON body.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let data = serde_json::to_vec(value)?;
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Body::from(data);
        Ok(())
    }

    /// A response is empty when no handler set a status or a body.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.body.is_empty()
    }

    /// Move status, headers and body of `other` into this response. Headers
    /// of `other` replace same-named headers here.
    pub fn update_from(&mut self, other: Response) {
        if let Some(status) = other.status {
            self.status = Some(status);
        }
        let mut last = None;
        for (name, value) in other.headers {
            // `HeaderMap::into_iter` yields `None` names for repeated values.
            let name = match name {
                Some(name) => {
                    self.headers.remove(&name);
                    last = Some(name.clone());
                    name
                }
                None => match &last {
                    Some(name) => name.clone(),
                    None => continue,
                },
            };
            self.headers.append(name, value);
        }
        self.body = other.body;
    }

    pub fn into_parts(self) -> (Option<StatusCode>, HeaderMap, Body) {
        (self.status, self.headers, self.body)
    }
}

/// A fully materialized HTTP response used to turn down a socket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Rejection {
    /// Materialize a response. A missing status becomes `403 Forbidden`.
    pub fn from_response(response: Response) -> Self {
        let (status, headers, body) = response.into_parts();
        Self {
            status: status.unwrap_or(StatusCode::FORBIDDEN),
            headers,
            body: body.collect(),
        }
    }
}
