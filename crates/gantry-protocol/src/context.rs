//! Request context: the per-request property bag threaded through a chain.
//!
//! The gateway builds one context per inbound request through its context
//! factory and hands it to the handler chain, which owns it until the chain
//! finishes. Handlers communicate by writing attributes that later handlers
//! read. A context is only ever touched by the thread driving its chain.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use uuid::Uuid;

use crate::request::Request;

/// What the handler chain needs from a context.
///
/// [`RequestContext`] is the default. Embedders that want typed fields next to
/// the open attribute map wrap it in their own type and implement this trait.
pub trait Context: Send + 'static {
    fn request(&self) -> &Request;
}

/// Default context: the request, an open attribute map, and identity
/// metadata.
pub struct RequestContext {
    request: Request,
    /// Unique identifier for this request.
    id: Uuid,
    /// When the gateway created the context.
    created_at: Instant,
    attributes: HashMap<String, Box<dyn Any + Send>>,
}

impl RequestContext {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Store `value` under `key`, returning the previous value if it had the
    /// same type.
    pub fn set<T: Any + Send>(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        self.attributes
            .insert(key.into(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// The value under `key`, if present and of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.attributes.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Remove and return the value under `key`. A value of a different type
    /// stays in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.attributes.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.attributes
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

impl Context for RequestContext {
    fn request(&self) -> &Request {
        &self.request
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}
