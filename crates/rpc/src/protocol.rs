//! Wire frames: requests, responses and subscription notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RpcError;

/// Protocol version string carried on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Suffix that marks subscription-establishing methods.
pub const SUBSCRIBE_SUFFIX: &str = "_subscribe";
/// Suffix that marks subscription-terminating methods.
pub const UNSUBSCRIBE_SUFFIX: &str = "_unsubscribe";
/// Suffix of server-initiated notification method names.
pub const NOTIFICATION_SUFFIX: &str = "_subscription";

/// Request identifier. Requests without one are notifications and produce
/// no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// An incoming request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    /// True when the frame carries no id and therefore expects no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Splits the method into `(namespace, name)` on the first underscore.
    pub fn split_method(&self) -> Option<(&str, &str)> {
        self.method.split_once('_')
    }
}

/// An outgoing response frame.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response.
    pub fn result(id: Id, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION, id, result: Some(result), error: None }
    }

    /// Error response; a missing id renders as null.
    pub fn error(id: Option<Id>, error: RpcError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION, id: id.unwrap_or(Id::Null), result: None, error: Some(error) }
    }

    /// Serializes the frame, falling back to a canned internal error if
    /// encoding itself fails.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"response encoding failed"}}"#
                .to_string()
        })
    }
}

/// Builds a subscription notification frame:
/// `{method: "<ns>_subscription", params: {subscription, result}}`.
pub fn notification_frame(namespace: &str, subscription_id: &str, result: &Value) -> String {
    let frame = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": format!("{namespace}{NOTIFICATION_SUFFIX}"),
        "params": {
            "subscription": subscription_id,
            "result": result,
        }
    });
    frame.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"kst_blockNumber"}"#).unwrap();
        assert_eq!(req.id, Some(Id::Number(1)));
        assert!(!req.is_notification());
        assert_eq!(req.split_method(), Some(("kst", "blockNumber")));
    }

    #[test]
    fn test_notification_has_no_id() {
        let req: Request = serde_json::from_str(r#"{"method":"kst_ping"}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_response_frames() {
        let ok = Response::result(Id::Number(7), serde_json::json!("0x1"));
        let frame: Value = serde_json::from_str(&ok.to_frame()).unwrap();
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["result"], "0x1");
        assert!(frame.get("error").is_none());

        let err = Response::error(None, RpcError::parse_error("bad json"));
        let frame: Value = serde_json::from_str(&err.to_frame()).unwrap();
        assert_eq!(frame["id"], Value::Null);
        assert_eq!(frame["error"]["code"], crate::error::PARSE_ERROR);
    }

    #[test]
    fn test_notification_frame_shape() {
        let frame = notification_frame("kst", "0xabc", &serde_json::json!({"number": 3}));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "kst_subscription");
        assert_eq!(value["params"]["subscription"], "0xabc");
        assert_eq!(value["params"]["result"]["number"], 3);
    }
}
