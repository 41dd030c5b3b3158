//! JSON-RPC 2.0 message shapes and classification for the MCP dialect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GenieError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Classify raw bytes by shape:
/// `id` + `method` is a request, `method` alone a notification, `id` with
/// `result` or `error` a response. Anything else is a protocol violation.
pub fn parse_message(raw: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| GenieError::Protocol(format!("malformed JSON-RPC message: {e}")))?;

    let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let has_method = value.get("method").is_some();
    let has_outcome = value.get("result").is_some() || value.get("error").is_some();

    if has_method && has_id {
        let req: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| GenieError::Protocol(format!("invalid request: {e}")))?;
        Ok(Message::Request(req))
    } else if has_method {
        let notif: JsonRpcNotification = serde_json::from_value(value)
            .map_err(|e| GenieError::Protocol(format!("invalid notification: {e}")))?;
        Ok(Message::Notification(notif))
    } else if has_id && has_outcome {
        let resp: JsonRpcResponse = serde_json::from_value(value)
            .map_err(|e| GenieError::Protocol(format!("invalid response: {e}")))?;
        Ok(Message::Response(resp))
    } else {
        Err(GenieError::Protocol(
            "unrecognized JSON-RPC message shape".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let req = JsonRpcRequest::new(7, "tools/call", Some(json!({"name": "echo"})));
        let raw = serde_json::to_vec(&req).unwrap();
        match parse_message(&raw).unwrap() {
            Message::Request(back) => assert_eq!(back, req),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_roundtrip() {
        let notif = JsonRpcNotification::new("notifications/initialized", None);
        let raw = serde_json::to_vec(&notif).unwrap();
        match parse_message(&raw).unwrap() {
            Message::Notification(back) => assert_eq!(back, notif),
            other => panic!("expected notification, got {other:?}"),
        }
        // No id and no params keys on the wire.
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(!text.contains("\"params\""));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: json!(7),
            result: Some(json!({"tools": []})),
            error: None,
        };
        let raw = serde_json::to_vec(&resp).unwrap();
        match parse_message(&raw).unwrap() {
            Message::Response(back) => assert_eq!(back, resp),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_classifies() {
        let raw = br#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#;
        match parse_message(raw).unwrap() {
            Message::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, METHOD_NOT_FOUND);
                assert_eq!(err.message, "Method not found");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_emission_always_sets_version() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        assert_eq!(req.jsonrpc, "2.0");
        let notif = JsonRpcNotification::new("x", None);
        assert_eq!(notif.jsonrpc, "2.0");
    }

    #[test]
    fn test_unknown_shape_is_rejected() {
        assert!(parse_message(br#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(parse_message(br#"{"id":1}"#).is_err());
        assert!(parse_message(b"not json at all").is_err());
        assert!(parse_message(br#"{"id":1,"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_null_id_means_notification_shape() {
        // A null id does not make a message a request.
        let raw = br#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#;
        match parse_message(raw).unwrap() {
            Message::Notification(n) => assert_eq!(n.method, "ping"),
            other => panic!("expected notification, got {other:?}"),
        }
    }
}
