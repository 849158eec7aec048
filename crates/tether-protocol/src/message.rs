//! JSON-RPC 2.0 frame union and codec.
//!
//! Decoding is a single hand-written validator over the four frame
//! shapes rather than a serde `untagged` enum: the shapes overlap once
//! unknown fields are tolerated, and a response carrying both `result`
//! and `error` (or neither) must be rejected, which untagged matching
//! cannot express.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A JSON-RPC request id: string or integer, preserved byte-for-byte
/// between a request and the response that answers it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Integer(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Integer(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    Invalid(String),
}

impl FrameError {
    fn invalid(message: impl Into<String>) -> Self {
        FrameError::Invalid(message.into())
    }
}

// ---------------------------------------------------------------------------
// Frame shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: ErrorObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// JsonRpcMessage
// ---------------------------------------------------------------------------

/// One JSON-RPC 2.0 frame. `params` and `result` payloads stay as raw
/// `serde_json::Value`, so numbers pass through without coercion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        })
    }

    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result,
        })
    }

    pub fn error_response(
        id: impl Into<RequestId>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        JsonRpcMessage::Error(JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            error: ErrorObject {
                code,
                message: message.into(),
                data,
            },
        })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => Some(&e.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    /// Encode to canonical JSON. No trailing newline; framing is the
    /// transport's concern.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate and classify a decoded JSON value as one of the four
    /// frame shapes.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let object = value
            .as_object()
            .ok_or_else(|| FrameError::invalid("frame is not a JSON object"))?;

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(FrameError::invalid(format!(
                    "unsupported jsonrpc version {other:?}"
                )))
            }
            None => return Err(FrameError::invalid("missing jsonrpc field")),
        }

        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");

        if has_method {
            if has_id {
                return Ok(JsonRpcMessage::Request(serde_json::from_value(value)?));
            }
            return Ok(JsonRpcMessage::Notification(serde_json::from_value(value)?));
        }

        if !has_id {
            return Err(FrameError::invalid("frame has neither method nor id"));
        }

        let has_result = object.contains_key("result");
        let has_error = object.contains_key("error");
        match (has_result, has_error) {
            (true, true) => Err(FrameError::invalid(
                "response carries both result and error",
            )),
            (false, false) => Err(FrameError::invalid(
                "response carries neither result nor error",
            )),
            (true, false) => Ok(JsonRpcMessage::Response(serde_json::from_value(value)?)),
            (false, true) => Ok(JsonRpcMessage::Error(serde_json::from_value(value)?)),
        }
    }
}

impl std::str::FromStr for JsonRpcMessage {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s)?;
        JsonRpcMessage::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(message: JsonRpcMessage) -> JsonRpcMessage {
        let encoded = message.encode().expect("encode");
        assert!(!encoded.ends_with('\n'));
        encoded.parse().expect("decode")
    }

    #[test]
    fn request_roundtrip_preserves_integer_id() {
        let message = JsonRpcMessage::request(7, "tools/list", Some(json!({ "cursor": "abc" })));
        assert_eq!(roundtrip(message.clone()), message);
        assert_eq!(message.id(), Some(&RequestId::Integer(7)));
    }

    #[test]
    fn request_roundtrip_preserves_string_id() {
        let message = JsonRpcMessage::request("req-7", "ping", None);
        let decoded = roundtrip(message.clone());
        assert_eq!(decoded, message);
        assert_eq!(decoded.id(), Some(&RequestId::String("req-7".to_string())));
    }

    #[test]
    fn string_and_integer_ids_are_distinct() {
        assert_ne!(RequestId::Integer(7), RequestId::String("7".to_string()));
    }

    #[test]
    fn response_and_error_roundtrip() {
        let response = JsonRpcMessage::response(1, json!({ "tools": [] }));
        assert_eq!(roundtrip(response.clone()), response);

        let error = JsonRpcMessage::error_response(2, -32601, "method not found", None);
        assert_eq!(roundtrip(error.clone()), error);
    }

    #[test]
    fn notification_roundtrip() {
        let message =
            JsonRpcMessage::notification("notifications/progress", Some(json!({ "progress": 3 })));
        assert_eq!(roundtrip(message.clone()), message);
        assert_eq!(message.id(), None);
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let decoded: JsonRpcMessage =
            r#"{"jsonrpc":"2.0","id":1,"result":{},"_meta":{"x":1},"extra":true}"#
                .parse()
                .expect("decode");
        assert!(matches!(decoded, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn decode_rejects_missing_or_wrong_jsonrpc() {
        assert!(r#"{"id":1,"result":{}}"#.parse::<JsonRpcMessage>().is_err());
        assert!(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#
            .parse::<JsonRpcMessage>()
            .is_err());
    }

    #[test]
    fn decode_rejects_result_and_error_together() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(raw.parse::<JsonRpcMessage>().is_err());
    }

    #[test]
    fn decode_rejects_response_with_neither_result_nor_error() {
        assert!(r#"{"jsonrpc":"2.0","id":1}"#.parse::<JsonRpcMessage>().is_err());
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!("not json".parse::<JsonRpcMessage>().is_err());
    }

    #[test]
    fn numeric_payloads_pass_through_untouched() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"result":{"big":9007199254740993,"float":0.1}}"#;
        let decoded: JsonRpcMessage = raw.parse().expect("decode");
        let JsonRpcMessage::Response(response) = decoded else {
            panic!("expected response");
        };
        assert_eq!(
            response.result["big"],
            json!(9007199254740993i64),
        );
        assert_eq!(response.result["float"], json!(0.1));
    }
}
