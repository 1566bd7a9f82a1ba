//! SSE transport: MCP over HTTP POST + a server-sent event stream.
//!
//! The client opens a long-lived `GET` stream. The server's first
//! `endpoint` event names the URL requests are POSTed to; responses come
//! back as `message` events and are matched to waiters by JSON-RPC id, so
//! any number of calls can be in flight at once.

use async_trait::async_trait;
use cortex_core::{ServerConfig, ToolCall, ToolDescriptor, TransportKind};
use futures::StreamExt;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Transport, TransportError, extra_headers};
use crate::protocol::{self, JsonRpcRequest, JsonRpcResponse, RpcChannel};
use crate::sse::SseParser;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct SseTransport {
    server_id: String,
    client: reqwest::Client,
    post_url: Url,
    headers: HeaderMap,
    pending: Pending,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream, wait for the endpoint, and handshake.
    pub async fn connect(config: &ServerConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        let raw_url = config
            .url
            .as_deref()
            .ok_or_else(|| TransportError::Open(format!("server '{}' has no url", config.id)))?;
        let stream_url = Url::parse(raw_url)
            .map_err(|e| TransportError::Open(format!("invalid url '{raw_url}': {e}")))?;
        let headers = extra_headers(&config.env)?;
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Open(e.to_string()))?;

        info!(server = %config.id, url = %stream_url, "Opening SSE stream");

        let response = client
            .get(stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| TransportError::Open(format!("GET {stream_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(TransportError::Open(format!(
                "GET {stream_url} returned {}",
                response.status()
            )));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(
            config.id.clone(),
            response,
            pending.clone(),
            alive.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(TransportError::Open(
                    "stream ended before announcing an endpoint".into(),
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Open(format!(
                    "no endpoint event within {}ms",
                    request_timeout.as_millis()
                )));
            }
        };
        let post_url = stream_url.join(&endpoint).map_err(|e| {
            reader.abort();
            TransportError::Open(format!("invalid endpoint '{endpoint}': {e}"))
        })?;
        debug!(server = %config.id, endpoint = %post_url, "SSE endpoint announced");

        let transport = Self {
            server_id: config.id.clone(),
            client,
            post_url,
            headers,
            pending,
            alive,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader,
        };
        protocol::handshake(&transport, request_timeout).await?;
        Ok(transport)
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Io(format!("POST {}: {e}", self.post_url)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn post_and_wait(
        &self,
        body: &JsonRpcRequest,
        rx: oneshot::Receiver<JsonRpcResponse>,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.post(body).await?;
        rx.await
            .map_err(|_| TransportError::Closed("event stream ended before the response".into()))
    }
}

#[async_trait]
impl RpcChannel for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = register_waiter(&self.pending, &self.alive, id).await?;

        let body = JsonRpcRequest::new(id, method, params);
        let outcome = tokio::time::timeout(timeout, self.post_and_wait(&body, rx)).await;
        match outcome {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(server = %self.server_id, id, method, "Request timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        protocol::list_tools(self, &self.server_id, self.request_timeout).await
    }

    async fn invoke(&self, call: &ToolCall, timeout: Duration) -> Result<Value, TransportError> {
        protocol::call_tool(self, call, timeout).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.reader.abort();
        self.pending.lock().await.clear();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Add a waiter for response `id`.
///
/// Liveness is checked while holding the pending map. The reader marks the
/// stream dead before draining the map, so a waiter is either refused here
/// or dropped by the drain.
async fn register_waiter(
    pending: &Pending,
    alive: &AtomicBool,
    id: u64,
) -> Result<oneshot::Receiver<JsonRpcResponse>, TransportError> {
    let mut waiters = pending.lock().await;
    if !alive.load(Ordering::Acquire) {
        return Err(TransportError::Closed("event stream ended".into()));
    }
    let (tx, rx) = oneshot::channel();
    waiters.insert(id, tx);
    Ok(rx)
}

/// Route stream events until the stream ends, then fail everything pending.
async fn read_stream(
    server_id: String,
    response: reqwest::Response,
    pending: Pending,
    alive: Arc<AtomicBool>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(server = %server_id, error = %e, "SSE stream read failed");
                break;
            }
        };
        for event in parser.feed(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") => match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                    None => debug!(server = %server_id, "Ignoring repeated endpoint event"),
                },
                None | Some("message") => route_message(&server_id, &pending, &event.data).await,
                Some(other) => debug!(server = %server_id, event = other, "Ignoring SSE event"),
            }
        }
    }

    alive.store(false, Ordering::Release);
    // dropping the senders fails every waiter
    let abandoned = pending.lock().await.drain().count();
    warn!(server = %server_id, pending = abandoned, "SSE stream ended");
}

async fn route_message(server_id: &str, pending: &Pending, data: &str) {
    let message: JsonRpcResponse = match serde_json::from_str(data) {
        Ok(message) => message,
        Err(e) => {
            debug!(server = %server_id, error = %e, "Ignoring non JSON-RPC event");
            return;
        }
    };
    let Some(id) = message.response_id() else {
        debug!(server = %server_id, method = ?message.method, "Ignoring server message");
        return;
    };
    match pending.lock().await.remove(&id) {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!(server = %server_id, id, "Discarding response nobody is waiting for"),
    }
}
