//! JSON-RPC 2.0 message model.
//!
//! Messages are classified from a pre-parsed `serde_json::Value` by the
//! presence/absence of `id` and `method`:
//! - Request: has both `id` and `method`
//! - Response: has `id` but no `method`
//! - Notification: has `method` but no `id`
//!
//! Payloads (`params`, `result`, `error`) stay untyped `Value`s; the policy
//! layer inspects them through small helpers where it has to.

use serde_json::{Map, Value, json};

/// LSP `MethodNotFound` error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// LSP `RequestCancelled` error code.
pub const REQUEST_CANCELLED: i64 = -32800;

/// LSP `RequestFailed` error code.
pub const REQUEST_FAILED: i64 = -32803;

/// A JSON-RPC request id: a string or an integer, never null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    Str(String),
}

impl RequestId {
    /// Parse an id from a JSON value. Floats, booleans, arrays, objects and
    /// null are all invalid.
    pub fn from_value(value: &Value) -> Option<RequestId> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::Str(s.clone())),
            _ => None,
        }
    }

    /// Render the id back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::Str(s) => json!(s),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The outcome half of a response: exactly one of `result`/`error` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The `result` payload, if the request succeeded.
    pub result: Option<Value>,
    /// The `error` object, if it failed.
    pub error: Option<Value>,
}

impl Reply {
    /// A successful reply.
    pub fn ok(result: Value) -> Reply {
        Reply {
            result: Some(result),
            error: None,
        }
    }

    /// An error reply from a code and message.
    pub fn err(code: i64, message: impl Into<String>) -> Reply {
        Reply {
            result: None,
            error: Some(json!({"code": code, "message": message.into()})),
        }
    }

    /// Whether this reply carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A classified JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Has both `id` and `method` — expects a response.
    Request {
        /// Request id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// Has `id` but no `method` — answers a previous request.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// Result or error payload.
        reply: Reply,
    },
    /// Has `method` but no `id` — fire-and-forget.
    Notification {
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
}

/// Why a parsed JSON value could not be classified as a message.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The `id` field is present but not a string or integer.
    #[error("invalid id field")]
    InvalidId,
    /// Neither `id` nor `method` is present.
    #[error("message has neither id nor method")]
    Unclassifiable,
}

impl Message {
    /// Build a request.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Message {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Message {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a response from a reply.
    pub fn response(id: RequestId, reply: Reply) -> Message {
        Message::Response { id, reply }
    }

    /// Build an error response from a code and message.
    pub fn error_response(id: RequestId, code: i64, message: impl Into<String>) -> Message {
        Message::Response {
            id,
            reply: Reply::err(code, message),
        }
    }

    /// The method name, if any. Responses have none.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    /// Classify a parsed JSON value. The caller has already validated the
    /// `jsonrpc` version field at the framing layer.
    pub fn classify(value: Value) -> Result<Message, ClassifyError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(ClassifyError::Unclassifiable),
        };

        let id = match obj.get("id") {
            // A null id only ever appears on server-side parse-error
            // responses; treat it as unclassifiable rather than invent an id.
            Some(Value::Null) | None => None,
            Some(v) => Some(RequestId::from_value(v).ok_or(ClassifyError::InvalidId)?),
        };
        let method = match obj.get("method") {
            Some(Value::String(m)) => Some(m.clone()),
            Some(_) => return Err(ClassifyError::Unclassifiable),
            None => None,
        };

        match (id, method) {
            (Some(id), Some(method)) => Ok(Message::Request {
                id,
                method,
                params: obj.remove("params"),
            }),
            (Some(id), None) => Ok(Message::Response {
                id,
                reply: Reply {
                    result: obj.remove("result"),
                    error: obj.remove("error"),
                },
            }),
            (None, Some(method)) => Ok(Message::Notification {
                method,
                params: obj.remove("params"),
            }),
            (None, None) => Err(ClassifyError::Unclassifiable),
        }
    }

    /// Render the message to a JSON value ready for framing.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), json!("2.0"));
        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".to_string(), id.to_value());
                obj.insert("method".to_string(), json!(method));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Response { id, reply } => {
                obj.insert("id".to_string(), id.to_value());
                match (&reply.result, &reply.error) {
                    (_, Some(error)) => {
                        obj.insert("error".to_string(), error.clone());
                    }
                    (Some(result), None) => {
                        obj.insert("result".to_string(), result.clone());
                    }
                    // A reply with neither half serializes as a null result.
                    (None, None) => {
                        obj.insert("result".to_string(), Value::Null);
                    }
                }
            }
            Message::Notification { method, params } => {
                obj.insert("method".to_string(), json!(method));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }
}
