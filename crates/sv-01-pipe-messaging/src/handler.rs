//! # Request Handlers
//!
//! A [`RequestHandler`] answers requests arriving on a session. A failure is
//! a [`HandlerError`]: the JSON object sent back as the `data` of the error
//! reply, so the requester sees every field the handler put in it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handles requests received on a session.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request. `request` holds the request fields without the id.
    async fn handle(&self, request: Map<String, Value>) -> Result<Value, HandlerError>;
}

/// Shared handler reference.
pub type SharedHandler = Arc<dyn RequestHandler>;

/// Error returned by a request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    data: Value,
}

impl HandlerError {
    /// An error with a `message` field.
    pub fn new(message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::String(message.into()));
        Self::from_fields(fields)
    }

    /// An error carrying exactly these fields.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            data: Value::Object(fields),
        }
    }

    /// An error carrying an arbitrary JSON value.
    pub fn from_value(data: Value) -> Self {
        Self { data }
    }

    /// Convert a native error. Its observable fields are the display text
    /// (`message`) and the type name (`name`).
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        Self::new(err.to_string()).with_field("name", Value::String(name))
    }

    /// Add or replace a field. Ignored when the data is not an object.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(fields) = &mut self.data {
            fields.insert(key.to_string(), value);
        }
        self
    }

    /// The value sent as `data` of the error reply.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.get("message").and_then(Value::as_str) {
            Some(message) => f.write_str(message),
            None => write!(f, "{}", self.data),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, request: Map<String, Value>) -> Result<Value, HandlerError> {
        (self.f)(request).await
    }
}

/// Wrap an async closure as a shared handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
