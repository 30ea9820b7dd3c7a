//! JSON-RPC 2.0 wire types shared by the client and server roles of the
//! Codex app-server connection. Each message is a single newline-delimited
//! line of JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outbound (or inbound, from the child's perspective) JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget JSON-RPC notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Error code returned for server requests the client does not implement.
pub const UNSUPPORTED_SERVER_REQUEST: i64 = -32000;

/// Any inbound line from the child: a request (has `id` + `method`), a
/// notification (`method`, no `id`), or a response (`id`, no `method`) to
/// one of our own outbound requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Response(JsonRpcResponse),
    Request {
        jsonrpc: String,
        id: u64,
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
    Notification {
        jsonrpc: String,
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::new(1, "initialize", Some(serde_json::json!({"a": 1})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn serialize_notification_without_params() {
        let notif = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&notif).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn inbound_response_vs_request_vs_notification() {
        let resp: InboundMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(resp, InboundMessage::Response(_)));

        let req: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":9,"method":"requestApproval","params":{}}"#,
        )
        .unwrap();
        assert!(matches!(req, InboundMessage::Request { .. }));

        let notif: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"item/agentMessage/delta","params":{"text":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(notif, InboundMessage::Notification { .. }));
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = JsonRpcResponse::err(3, UNSUPPORTED_SERVER_REQUEST, "Unsupported server request");
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: JsonRpcResponse = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_error());
        assert_eq!(parsed.error.unwrap().code, UNSUPPORTED_SERVER_REQUEST);
    }
}
