//! Tool types — descriptors, calls, results, and the dispatcher seam.
//!
//! Tools are hosted by backend servers. The agent never executes a tool
//! itself; it hands a `ToolCall` to a `ToolDispatcher` and gets back an
//! immutable `ToolResult`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ToolErrorKind;

/// A callable tool discovered on a backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique tool name
    pub name: String,

    /// The server hosting this tool
    pub server_id: String,

    /// JSON Schema describing the tool's parameters
    pub input_schema: serde_json::Value,

    /// What the tool does (shown to planners)
    #[serde(default)]
    pub description: String,
}

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique per invocation
    pub call_id: String,

    /// Name of the tool to execute
    pub tool_name: String,

    /// Arguments as a JSON value (normally an object)
    pub arguments: serde_json::Value,

    pub issued_at: DateTime<Utc>,
}

impl ToolCall {
    /// Create a call with a fresh call id.
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
            issued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Why a call failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub detail: String,
}

/// The result of a tool execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    pub tool_name: String,

    pub status: ToolStatus,

    /// Normalized output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Failure detail on error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,

    pub elapsed_ms: u64,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, payload: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Ok,
            payload: Some(payload),
            error: None,
            elapsed_ms: elapsed_millis(elapsed),
        }
    }

    pub fn failed(
        call: &ToolCall,
        kind: ToolErrorKind,
        detail: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Error,
            payload: None,
            error: Some(ToolFailure {
                kind,
                detail: detail.into(),
            }),
            elapsed_ms: elapsed_millis(elapsed),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// The failure kind, if this result is an error.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// One-line rendering for logs, prompts, and failure summaries.
    pub fn summary(&self) -> String {
        match (&self.payload, &self.error) {
            (Some(payload), _) => format!("{} -> ok: {}", self.tool_name, render_payload(payload)),
            (None, Some(err)) => format!("{} -> {}: {}", self.tool_name, err.kind, err.detail),
            (None, None) => format!("{} -> {:?}", self.tool_name, self.status),
        }
    }
}

/// Render a payload as text: bare strings unquoted, everything else as JSON.
pub fn render_payload(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn elapsed_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// The seam between the strategy loop and whatever routes tool calls.
///
/// Per-call failures are never returned as `Err`: they come back as a
/// failed `ToolResult` so planning can react to them.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Every tool currently callable.
    fn tools(&self) -> Vec<ToolDescriptor>;

    /// Execute a pre-built call with the given timeout.
    async fn dispatch(&self, call: ToolCall, timeout: Duration) -> ToolResult;
}
