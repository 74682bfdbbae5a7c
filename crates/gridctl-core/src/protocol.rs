//! JSON-RPC 2.0 framing and the MCP message shapes the gateway speaks.
//!
//! The gateway rewrites tool names inside raw frames, so the wire model is
//! defined here instead of behind an SDK's typed service layer.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::ToolDescriptor;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    /// A notification carries no id and expects no response.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Build a success response value.
pub fn response_ok(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response value.
pub fn response_err(id: Option<Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

/// Result payload of `tools/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// One content block of a tool-call result. Only text blocks are produced
/// by the gateway itself; upstream blocks pass through verbatim as values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// Result payload of `tools/call`. Upstream failures surface here with
/// `is_error = true`; the JSON-RPC call itself still succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Result payload of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

impl InitializeResult {
    pub fn gateway(name: &str, version: &str) -> Self {
        Self {
            protocol_version: crate::types::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({
                "tools": { "listChanged": true },
                "prompts": {},
                "resources": {},
            }),
            server_info: ServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", json!({}));
        assert!(note.is_notification());
        let encoded = serde_json::to_value(&note).unwrap();
        assert!(encoded.get("id").is_none());
    }

    #[test]
    fn call_result_error_round_trips_wire_field() {
        let result = CallToolResult::error("boom");
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["isError"], true);
        assert_eq!(encoded["content"][0]["type"], "text");

        let ok = CallToolResult::text("fine");
        let encoded = serde_json::to_value(&ok).unwrap();
        assert!(encoded.get("isError").is_none());
    }

    #[test]
    fn response_err_carries_code_and_message() {
        let err = response_err(Some(Value::from(7)), METHOD_NOT_FOUND, "no such method");
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(err["id"], 7);
    }

    #[test]
    fn parses_upstream_response_with_error() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32602,"message":"bad params"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
        assert!(resp.result.is_none());
    }
}
