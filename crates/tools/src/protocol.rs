//! JSON-RPC 2.0 framing and the MCP methods shared by the stdio and SSE
//! transports.

use async_trait::async_trait;
use cortex_core::{ToolCall, ToolDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::transport::TransportError;

/// MCP revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "invalid params".
pub const INVALID_PARAMS: i64 = -32602;

/// Upper bound on `tools/list` pages, in case a server repeats a cursor.
const MAX_TOOL_PAGES: usize = 64;

/// A request or notification sent to a server.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Anything a server sends back: a response, a notification, or a
/// server-initiated request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// The id this message answers. `None` for notifications and
    /// server-initiated requests, which carry a `method`.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id
            .as_ref()
            .and_then(|id| id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok())))
    }

    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A request/notification channel to one MCP server.
#[async_trait]
pub(crate) trait RpcChannel: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;
}

/// `initialize` followed by `notifications/initialized`. Returns the
/// server's `initialize` result.
pub(crate) async fn handshake(
    channel: &dyn RpcChannel,
    timeout: Duration,
) -> Result<Value, TransportError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "cortex",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = channel.request("initialize", Some(params), timeout).await?;
    channel.notify("notifications/initialized", None).await?;
    Ok(result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<McpTool>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// A tool as listed by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl McpTool {
    pub fn into_descriptor(self, server_id: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name,
            server_id: server_id.to_string(),
            input_schema: self.input_schema,
            description: self.description.unwrap_or_default(),
        }
    }
}

/// Every page of `tools/list`.
pub(crate) async fn list_tools(
    channel: &dyn RpcChannel,
    server_id: &str,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let result = channel.request("tools/list", params, timeout).await?;
        let page: ToolsPage = serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("malformed tools/list result: {e}")))?;
        tools.extend(page.tools.into_iter().map(|t| t.into_descriptor(server_id)));
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }
    tracing::warn!(server = %server_id, pages = MAX_TOOL_PAGES, "tools/list kept paginating, truncating");
    Ok(tools)
}

/// `tools/call`, normalized.
pub(crate) async fn call_tool(
    channel: &dyn RpcChannel,
    call: &ToolCall,
    timeout: Duration,
) -> Result<Value, TransportError> {
    let params = json!({
        "name": call.tool_name,
        "arguments": call.arguments,
    });
    let result = channel.request("tools/call", Some(params), timeout).await?;
    normalize_call_result(result)
}

/// Turn a `tools/call` result into a payload.
///
/// `structuredContent` wins; otherwise a single text item is parsed as JSON
/// when it can be, falling back to the raw string. `isError` results become
/// tool failures carrying the text.
pub fn normalize_call_result(result: Value) -> Result<Value, TransportError> {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let detail = if texts.is_empty() {
            "tool reported an error".to_string()
        } else {
            texts.join("\n")
        };
        return Err(TransportError::ToolFailed(detail));
    }

    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }

    match texts.as_slice() {
        [] => Ok(result.get("content").cloned().unwrap_or(result)),
        [single] => Ok(serde_json::from_str(single).unwrap_or_else(|_| Value::String(single.to_string()))),
        many => Ok(Value::String(many.join("\n"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::ToolErrorKind;

    #[test]
    fn request_serialization_omits_missing_fields() {
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));

        let note = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn notifications_have_no_response_id() {
        let note: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#).unwrap();
        assert_eq!(note.response_id(), None);

        let server_request: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).unwrap();
        assert_eq!(server_request.response_id(), None);

        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"12","result":{}}"#).unwrap();
        assert_eq!(response.response_id(), Some(12));
    }

    #[test]
    fn invalid_params_maps_to_invalid_arguments() {
        let response: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"missing b"}}"#,
        )
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::InvalidArguments);

        let response: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#,
        )
        .unwrap();
        assert_eq!(response.into_result().unwrap_err().kind(), ToolErrorKind::ExecutionFailed);
    }

    #[test]
    fn single_text_item_is_parsed_as_json() {
        let result = json!({"content": [{"type": "text", "text": "5"}]});
        assert_eq!(normalize_call_result(result).unwrap(), json!(5));

        let result = json!({"content": [{"type": "text", "text": "{\"id\": \"doc-1\"}"}]});
        assert_eq!(normalize_call_result(result).unwrap(), json!({"id": "doc-1"}));
    }

    #[test]
    fn plain_text_stays_a_string() {
        let result = json!({"content": [{"type": "text", "text": "hello world"}]});
        assert_eq!(normalize_call_result(result).unwrap(), json!("hello world"));

        let result = json!({"content": [
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"}
        ]});
        assert_eq!(normalize_call_result(result).unwrap(), json!("line one\nline two"));
    }

    #[test]
    fn structured_content_wins() {
        let result = json!({
            "content": [{"type": "text", "text": "5"}],
            "structuredContent": {"sum": 5}
        });
        assert_eq!(normalize_call_result(result).unwrap(), json!({"sum": 5}));
    }

    #[test]
    fn is_error_becomes_execution_failure() {
        let result = json!({"isError": true, "content": [{"type": "text", "text": "division by zero"}]});
        let err = normalize_call_result(result).unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::ExecutionFailed);
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn tool_listing_defaults_missing_schema() {
        let tool: McpTool = serde_json::from_value(json!({"name": "ping"})).unwrap();
        let descriptor = tool.into_descriptor("util");
        assert_eq!(descriptor.server_id, "util");
        assert_eq!(descriptor.input_schema["type"], "object");
        assert_eq!(descriptor.description, "");
    }
}
