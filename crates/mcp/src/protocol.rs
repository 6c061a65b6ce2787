//! JSON-RPC 2.0 framing and the MCP payloads we use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

/// An outgoing request or, with `id: None`, a notification.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method,
            params,
        }
    }
}

/// Any incoming line: a response, a server notification or a server request.
#[derive(Debug, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    fn has_null_id(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    /// Notifications carry a method and no id (or a null one).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.has_null_id()
    }

    /// Requests initiated by the server carry both an id and a method.
    pub fn is_server_request(&self) -> bool {
        self.method.is_some() && !self.has_null_id()
    }

    /// A response the server could not tie to a request id, such as a parse
    /// error. With one request in flight it answers that request.
    pub fn is_unaddressed_response(&self) -> bool {
        self.method.is_none()
            && self.has_null_id()
            && (self.result.is_some() || self.error.is_some())
    }

    pub fn id_matches(&self, expected: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(expected)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: ServerInfo,
}

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpToolCallResult {
    /// All `text` blocks, concatenated in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text.as_deref())
            .collect()
    }

    /// Error text for an `isError` result.
    pub fn error_text(&self) -> String {
        self.content
            .first()
            .and_then(|c| c.text.clone())
            .unwrap_or_else(|| "tool returned error".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let value = serde_json::to_value(JsonRpcRequest::notification(
            "notifications/initialized",
            None,
        ))
        .unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[test]
    fn message_classification() {
        let note: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/progress"})).unwrap();
        assert!(note.is_notification());

        let req: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 9, "method": "roots/list"})).unwrap();
        assert!(req.is_server_request());

        let resp: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": {}})).unwrap();
        assert!(resp.id_matches(3));
        assert!(!resp.id_matches(4));
        assert!(!resp.is_unaddressed_response());

        let parse_error: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        assert!(!parse_error.is_notification());
        assert!(parse_error.is_unaddressed_response());
    }

    #[test]
    fn call_result_text_and_errors() {
        let ok: McpToolCallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "b"}
            ]
        }))
        .unwrap();
        assert_eq!(ok.text(), "ab");

        let failed: McpToolCallResult =
            serde_json::from_value(json!({"content": [], "isError": true})).unwrap();
        assert!(failed.is_error);
        assert_eq!(failed.error_text(), "tool returned error");
    }
}
