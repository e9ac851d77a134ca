//! JSON-RPC error object and the error-code table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Parse failure (malformed JSON).
pub const PARSE_ERROR: i64 = -32700;
/// Request object is not a valid JSON-RPC frame.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown `(namespace, method)` pair.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Argument decode or arity failure.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler panic or other server-side fault.
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic server error.
pub const SERVER_ERROR: i64 = -32000;
/// Execution timeout.
pub const TIMEOUT_ERROR: i64 = -32001;
/// Per-connection subscription limit reached.
pub const TOO_MANY_SUBSCRIPTIONS: i64 = -32002;
/// Server is shutting down.
pub const SHUTTING_DOWN: i64 = -32003;
/// VM revert; `data` carries the raw return payload.
pub const REVERT_ERROR: i64 = 3;

/// A JSON-RPC error object: `{code, message, data?}`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self { code, message: message.into(), data: Some(data) }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, format!("parse error: {}", detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, format!("invalid request: {}", detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("the method {method} does not exist/is not available"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {}", detail.into()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, detail.into())
    }

    pub fn server_error(detail: impl Into<String>) -> Self {
        Self::new(SERVER_ERROR, detail.into())
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT_ERROR, "request execution timed out")
    }

    pub fn too_many_subscriptions(limit: usize) -> Self {
        Self::new(
            TOO_MANY_SUBSCRIPTIONS,
            format!("maximum {limit} subscriptions are allowed for a connection"),
        )
    }

    pub fn shutting_down() -> Self {
        Self::new(SHUTTING_DOWN, "server is shutting down")
    }

    pub fn notifications_unsupported() -> Self {
        Self::new(SERVER_ERROR, "notifications not supported by this transport")
    }

    /// Revert error carrying the human-readable reason in the message and
    /// the raw payload in `data`.
    pub fn revert(reason: &str, payload: Option<Value>) -> Self {
        Self {
            code: REVERT_ERROR,
            message: format!("execution reverted: {reason}"),
            data: payload,
        }
    }
}
