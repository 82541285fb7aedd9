//! # Message Envelope
//!
//! ```text
//! {"request":  "<id>", ...fields}   -> handled by the request handler
//! {"response": "<id>", "data": v}   -> resolves pending request <id>
//! {"error":    "<id>", "data": e}   -> rejects pending request <id>
//! ```

use serde_json::{json, Map, Value};

pub const REQUEST_KEY: &str = "request";
pub const RESPONSE_KEY: &str = "response";
pub const ERROR_KEY: &str = "error";
pub const DATA_KEY: &str = "data";

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Incoming request. `fields` excludes the `request` key.
    Request { id: String, fields: Map<String, Value> },
    /// Successful reply.
    Response { id: String, data: Value },
    /// Failed reply.
    Error { id: String, data: Value },
    /// Anything else; only surfaced as a message event.
    Other,
}

impl Envelope {
    /// Classify a JSON message.
    pub fn parse(message: &Value) -> Self {
        let Some(object) = message.as_object() else {
            return Self::Other;
        };

        let id_of = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        };
        let data = || object.get(DATA_KEY).cloned().unwrap_or(Value::Null);

        if let Some(id) = id_of(REQUEST_KEY) {
            let mut fields = object.clone();
            fields.remove(REQUEST_KEY);
            Self::Request { id, fields }
        } else if let Some(id) = id_of(RESPONSE_KEY) {
            Self::Response { id, data: data() }
        } else if let Some(id) = id_of(ERROR_KEY) {
            Self::Error { id, data: data() }
        } else {
            Self::Other
        }
    }
}

/// Build a request message from the caller's fields.
pub fn request_message(id: &str, mut fields: Map<String, Value>) -> Value {
    fields.insert(REQUEST_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(fields)
}

/// Build a successful reply.
pub fn response_message(id: &str, data: Value) -> Value {
    json!({ RESPONSE_KEY: id, DATA_KEY: data })
}

/// Build a failed reply.
pub fn error_message(id: &str, data: Value) -> Value {
    json!({ ERROR_KEY: id, DATA_KEY: data })
}
