//! Transport adapters — one interface over every way of reaching a tool
//! server.
//!
//! The dispatcher only ever talks to `dyn Transport`; it never branches on
//! the transport kind. A `Connector` turns a `ServerConfig` into a ready
//! (handshaken) transport, which is also how reconnects happen.

pub mod http;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use cortex_core::{ServerConfig, ToolCall, ToolDescriptor, ToolErrorKind, TransportKind};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::INVALID_PARAMS;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Failures below the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The connection is gone; nothing more can be sent on it.
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The tool ran and reported failure.
    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl TransportError {
    /// The failure kind a dispatcher reports for this error.
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::Timeout(_) => ToolErrorKind::Timeout,
            Self::Rpc { code, .. } if *code == INVALID_PARAMS => ToolErrorKind::InvalidArguments,
            Self::Rpc { .. } | Self::ToolFailed(_) => ToolErrorKind::ExecutionFailed,
            Self::Open(_) => ToolErrorKind::ConnectionUnavailable,
            Self::Closed(_) | Self::Io(_) | Self::Protocol(_) | Self::Http { .. } => {
                ToolErrorKind::TransportFailure
            }
        }
    }

    /// Whether the connection must be considered dead after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// An open connection to one tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    fn server_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// List the tools this server offers.
    async fn discover(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Execute a call and return its normalized payload. The timeout covers
    /// any queueing the transport does before the request goes out.
    async fn invoke(
        &self,
        call: &ToolCall,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    /// False once the connection is known to be unusable.
    fn is_alive(&self) -> bool;

    /// Release the connection (kills child processes, drops streams).
    async fn close(&self);
}

/// Opens transports from configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// The default connector: stdio and SSE speak MCP, http is plain REST.
#[derive(Debug, Clone)]
pub struct McpConnector {
    request_timeout: Duration,
}

impl McpConnector {
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Timeout for the handshake and discovery requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for McpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn open(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
        match config.transport {
            TransportKind::Stdio => Ok(Arc::new(
                StdioTransport::spawn(config, self.request_timeout).await?,
            )),
            TransportKind::Sse => Ok(Arc::new(
                SseTransport::connect(config, self.request_timeout).await?,
            )),
            TransportKind::Http => Ok(Arc::new(HttpTransport::new(config)?)),
        }
    }
}

/// Extra request headers for network transports, taken from `env`.
pub(crate) fn extra_headers(env: &HashMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in env {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Open(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Open(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).kind(),
            ToolErrorKind::Timeout
        );
        assert_eq!(
            TransportError::Closed("eof".into()).kind(),
            ToolErrorKind::TransportFailure
        );
        assert_eq!(
            TransportError::Http { status: 500, body: String::new() }.kind(),
            ToolErrorKind::TransportFailure
        );
        assert!(TransportError::Closed("eof".into()).is_fatal());
        assert!(!TransportError::Io("reset".into()).is_fatal());
    }

    #[test]
    fn header_names_are_checked() {
        let mut env = HashMap::new();
        env.insert("Authorization".to_string(), "Bearer abc".to_string());
        let headers = extra_headers(&env).unwrap();
        assert_eq!(headers["authorization"], "Bearer abc");

        env.insert("bad header".to_string(), "x".to_string());
        assert!(extra_headers(&env).is_err());
    }

    #[tokio::test]
    async fn connector_reports_spawn_failure() {
        let config = ServerConfig::stdio("ghost", "/nonexistent/cortex-test-binary", vec![]);
        let err = McpConnector::new()
            .with_request_timeout(Duration::from_secs(1))
            .open(&config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Open(_)));
    }
}
