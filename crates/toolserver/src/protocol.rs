//! Wire types for the tool-server protocol: JSON-RPC 2.0, one message
//! per line.
//!
//! The core is the client. Servers must answer `initialize`,
//! `list_tools`, and `call_tool`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use valet_domain::tool::ToolSpec;

pub const PROTOCOL_VERSION: &str = "2025-03-01";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON-RPC frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request carrying an `id`; the server must answer it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Split into the result value or the error object.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl InitializeParams {
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.into(),
            client_name: "valet".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// One tool as advertised by a server in its `list_tools` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ServerToolDef {
    /// Convert to the canonical shape held by the manager.
    pub fn into_spec(self) -> ToolSpec {
        ToolSpec {
            name: self.name,
            description: self.description,
            json_schema: self.input_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ServerToolDef>,
}

/// One content block in a `call_tool` reply. Only text blocks carry
/// payload the core forwards; anything else is stringified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate the textual content blocks of the response.
    pub fn joined_text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Unsupported => None,
            })
            .collect();
        if parts.is_empty() {
            "Tool returned no output.".into()
        } else {
            parts.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_missing_params() {
        let req = RpcRequest::new(7, "list_tools", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let json =
            serde_json::to_string(&RpcNotification::new("notifications/initialized")).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn response_into_result_splits_errors() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(ok.into_result().is_ok());

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let rpc_err = err.into_result().unwrap_err();
        assert_eq!(rpc_err.code, -32601);
    }

    #[test]
    fn tool_def_defaults_schema_and_description() {
        let result: ListToolsResult =
            serde_json::from_str(r#"{"tools":[{"name":"ping"}]}"#).unwrap();
        let spec = result.tools[0].clone().into_spec();
        assert_eq!(spec.name, "ping");
        assert_eq!(spec.description, "");
        assert_eq!(spec.json_schema["type"], "object");
    }

    #[test]
    fn joined_text_concatenates_text_blocks() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"a"},{"type":"image","data":"…"},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(result.joined_text(), "a\nb");
    }

    #[test]
    fn joined_text_handles_empty_content() {
        let result = CallToolResult {
            content: vec![],
            is_error: false,
        };
        assert_eq!(result.joined_text(), "Tool returned no output.");
    }
}
