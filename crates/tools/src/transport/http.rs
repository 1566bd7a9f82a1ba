//! REST transport: tools declared in configuration, each mapped to an
//! endpoint on one host.
//!
//! `GET` tools receive their arguments as query parameters; every other
//! method gets them as a JSON body. There is no session to keep alive, so
//! the transport never dies.

use async_trait::async_trait;
use cortex_core::server::HttpToolConfig;
use cortex_core::tool::render_payload;
use cortex_core::{ServerConfig, ToolCall, ToolDescriptor, TransportKind};
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Transport, TransportError, extra_headers};

pub struct HttpTransport {
    server_id: String,
    host: String,
    tools: Vec<HttpToolConfig>,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, TransportError> {
        let host = config
            .url
            .clone()
            .ok_or_else(|| TransportError::Open(format!("server '{}' has no url", config.id)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        Ok(Self {
            server_id: config.id.clone(),
            host: host.trim_end_matches('/').to_string(),
            tools: config.tools.clone(),
            client,
            headers: extra_headers(&config.env)?,
        })
    }

    fn tool(&self, name: &str) -> Result<&HttpToolConfig, TransportError> {
        self.tools.iter().find(|t| t.name == name).ok_or_else(|| {
            TransportError::Protocol(format!("'{name}' is not served by '{}'", self.server_id))
        })
    }
}

/// Query pairs for a GET tool. Strings go in raw, other values as JSON.
fn query_pairs(arguments: &Value) -> Vec<(String, String)> {
    arguments
        .as_object()
        .map(|args| {
            args.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), render_payload(v)))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Transport for HttpTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        Ok(self
            .tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.clone(),
                server_id: self.server_id.clone(),
                input_schema: tool.parameters.clone(),
                description: tool.description.clone(),
            })
            .collect())
    }

    async fn invoke(&self, call: &ToolCall, timeout: Duration) -> Result<Value, TransportError> {
        let tool = self.tool(&call.tool_name)?;
        let url = format!("{}{}", self.host, tool.endpoint);
        let method = Method::from_bytes(tool.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransportError::Protocol(format!("invalid HTTP method '{}'", tool.method)))?;

        debug!(server = %self.server_id, tool = %tool.name, %method, %url, "REST call");

        let request = if method == Method::GET {
            self.client.get(&url).query(&query_pairs(&call.arguments))
        } else {
            self.client.request(method.clone(), &url).json(&call.arguments)
        };

        let response = request
            .headers(self.headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Io(format!("{method} {url}: {e}"))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Io(format!("reading {url}: {e}"))
            }
        })?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) {}
}
