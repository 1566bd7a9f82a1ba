//! Backend server descriptors and connection liveness.
//!
//! A `ServerConfig` is the resolved, declarative description of one tool
//! backend. The configuration crate owns the file format; everything below
//! the dispatcher only ever sees this struct.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// How the dispatcher reaches a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
    #[default]
    Stdio,
    /// HTTP POST for requests, server-sent events for responses.
    Sse,
    /// Plain REST endpoints declared statically in configuration.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
        };
        f.write_str(s)
    }
}

/// One configured backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server identifier
    pub id: String,

    /// Transport used to reach the server
    #[serde(default)]
    pub transport: TransportKind,

    /// Command to spawn (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Startup arguments (stdio)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory for the child process (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Extra environment for the child process, or extra headers (sse/http)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Stream URL (sse) or base host (http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Statically declared tools (http)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<HttpToolConfig>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // env values usually carry credentials
        let env_keys: Vec<&String> = self.env.keys().collect();
        f.debug_struct("ServerConfig")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &env_keys)
            .field("url", &self.url)
            .field("tools", &self.tools)
            .finish()
    }
}

impl ServerConfig {
    /// A stdio server running `command args...`.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            cwd: None,
            env: HashMap::new(),
            url: None,
            tools: vec![],
        }
    }

    /// An SSE server whose event stream lives at `url`.
    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportKind::Sse,
            command: None,
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            url: Some(url.into()),
            tools: vec![],
        }
    }

    /// A REST server at `host` exposing the given static tools.
    pub fn http(id: impl Into<String>, host: impl Into<String>, tools: Vec<HttpToolConfig>) -> Self {
        Self {
            id: id.into(),
            transport: TransportKind::Http,
            command: None,
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            url: Some(host.into()),
            tools,
        }
    }

    /// Human-readable endpoint (command line or URL) for logs.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_default()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            TransportKind::Sse | TransportKind::Http => self.url.clone().unwrap_or_default(),
        }
    }
}

/// A REST tool declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,

    /// Path appended to the server host, e.g. `/send_email`
    pub endpoint: String,

    /// `GET` sends arguments as query parameters, anything else POSTs JSON
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema of the arguments
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_method() -> String {
    "POST".into()
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Liveness of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_tool_defaults_to_post() {
        let tool: HttpToolConfig = from_json(r#"{"name":"send_email","endpoint":"/send_email"}"#);
        assert_eq!(tool.method, "POST");
        assert_eq!(tool.parameters["type"], "object");
    }

    #[test]
    fn debug_output_hides_env_values() {
        let mut config = ServerConfig::stdio("gmail", "python", vec!["gmail.py".into()]);
        config.env.insert("GMAIL_TOKEN".into(), "super-secret".into());
        let debug = format!("{config:?}");
        assert!(debug.contains("GMAIL_TOKEN"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn endpoint_renders_command_line() {
        let config = ServerConfig::stdio("math", "python", vec!["math_server.py".into()]);
        assert_eq!(config.endpoint(), "python math_server.py");
        assert_eq!(TransportKind::Sse.to_string(), "sse");
    }

    fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> T {
        serde_json::from_str(json).unwrap()
    }
}
