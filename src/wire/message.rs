//! JSON-RPC shaped wire messages.
//!
//! A [`Message`] is exactly one of a request, a notification, or a response.
//! The on-wire object is flat (`jsonrpc`, `id`, `method`, `params`,
//! `result`, `error`); the variant is recovered from which fields are
//! present. Serialization goes through a private raw shape so that a present
//! `null` (`"result": null`) stays distinct from an absent field.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol version tag emitted on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Correlation identifier of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id (the form this crate issues).
    Number(i64),
    /// String id (accepted from peers).
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| format!("request id must be an integer, got {n}")),
            Value::String(s) => Ok(Self::String(s)),
            other => Err(format!("request id must be a number or string, got {other}")),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Number(n) => Value::from(n),
            Self::String(s) => Value::String(s),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

// ── Error object ──────────────────────────────────────────────────────────────

/// Protocol-level error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with an arbitrary code.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32700`: the peer sent something that was not JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(error_codes::PARSE_ERROR, "Parse error")
    }

    /// `-32600`: the JSON was not a valid request.
    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(error_codes::INVALID_REQUEST, "Invalid Request")
    }

    /// `-32601`: no handler is registered for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// `-32602`: the params did not match what the method expects.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    /// `-32603`: the handler failed.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A call that expects exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, unique among in-flight requests of one sender.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Opaque parameters.
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Opaque parameters.
    pub params: Option<Value>,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered; `None` when the peer could not
    /// determine it (`"id": null`).
    pub id: Option<RequestId>,
    /// Result value or error object.
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    /// Method call expecting a response.
    Request(Request),
    /// One-way method call.
    Notification(Notification),
    /// Answer to an earlier request.
    Response(Response),
}

impl Message {
    /// Build a request frame.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification frame.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(note) => Some(&note.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

// ── Raw wire shape ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Deserialize a field that is present on the wire, keeping `null` as
/// `Some(Value::Null)`. Absent fields fall back to `None` via `default`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawMessage> for Message {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        if let Some(version) = raw.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(format!("unsupported jsonrpc version {version:?}"));
            }
        }

        if let Some(method) = raw.method {
            if raw.result.is_some() || raw.error.is_some() {
                return Err(format!("message for {method:?} carries result or error"));
            }
            return match raw.id {
                None => Ok(Self::Notification(Notification {
                    method,
                    params: raw.params,
                })),
                Some(id) => Ok(Self::Request(Request {
                    id: RequestId::from_value(id)?,
                    method,
                    params: raw.params,
                })),
            };
        }

        let id = match raw.id {
            None => return Err("message has neither method nor id".to_owned()),
            Some(Value::Null) => None,
            Some(id) => Some(RequestId::from_value(id)?),
        };

        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            (Some(_), Some(_)) => return Err("response carries both result and error".to_owned()),
            (None, None) => return Err("response carries neither result nor error".to_owned()),
        };

        Ok(Self::Response(Response { id, outcome }))
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let mut raw = Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            ..Self::default()
        };
        match message {
            Message::Request(req) => {
                raw.id = Some(req.id.into_value());
                raw.method = Some(req.method);
                raw.params = req.params;
            }
            Message::Notification(note) => {
                raw.method = Some(note.method);
                raw.params = note.params;
            }
            Message::Response(resp) => {
                raw.id = Some(resp.id.map_or(Value::Null, RequestId::into_value));
                match resp.outcome {
                    Ok(result) => raw.result = Some(result),
                    Err(error) => raw.error = Some(error),
                }
            }
        }
        raw
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
