//! Stdio transport: a child process speaking newline-delimited JSON-RPC on
//! stdin/stdout.
//!
//! One request is on the wire at a time. The wire mutex (tokio's, which is
//! fair) is held from writing a request until its response is read, so
//! concurrent callers are served strictly in arrival order. A caller that
//! times out abandons its exchange; the late response is discarded by the
//! next caller because its id does not match.

use async_trait::async_trait;
use cortex_core::{ServerConfig, ToolCall, ToolDescriptor, TransportKind};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Transport, TransportError};
use crate::protocol::{self, JsonRpcRequest, JsonRpcResponse, RpcChannel};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Wire {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    /// Bytes of a line whose read was cut short by a timeout
    partial: Vec<u8>,
    /// Still true on entry when the previous write was cut short
    writing: bool,
}

impl Wire {
    /// Next complete line, or `None` at EOF.
    async fn read_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let n = self.reader.read_until(b'\n', &mut self.partial).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.partial)))
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(line).await?;
        self.writer.flush().await
    }
}

pub struct StdioTransport {
    server_id: String,
    wire: Mutex<Wire>,
    child: std::sync::Mutex<Option<Child>>,
    alive: AtomicBool,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the configured command and perform the MCP handshake.
    pub async fn spawn(config: &ServerConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| TransportError::Open(format!("server '{}' has no command", config.id)))?;

        info!(server = %config.id, command = %config.endpoint(), "Spawning stdio server");

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Open(format!("failed to spawn `{command}`: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Open("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Open("child stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(config.id.clone(), stderr);
        }

        let transport = Self::build(&config.id, stdout, stdin, Some(child), request_timeout);
        let init = protocol::handshake(&transport, request_timeout).await?;
        debug!(
            server = %config.id,
            server_info = %init.get("serverInfo").cloned().unwrap_or_default(),
            "MCP handshake complete"
        );
        Ok(transport)
    }

    /// A transport over arbitrary streams, without a handshake. The peer is
    /// whatever sits on the other end of `reader`/`writer`.
    pub fn from_io<R, W>(
        server_id: impl Into<String>,
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(&server_id.into(), reader, writer, None, request_timeout)
    }

    fn build<R, W>(
        server_id: &str,
        reader: R,
        writer: W,
        child: Option<Child>,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_id: server_id.to_string(),
            wire: Mutex::new(Wire {
                reader: BufReader::new(Box::new(reader) as BoxedReader),
                writer: Box::new(writer),
                partial: Vec::new(),
                writing: false,
            }),
            child: std::sync::Mutex::new(child),
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    fn mark_dead(&self, reason: impl Into<String>) -> TransportError {
        let reason = reason.into();
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!(server = %self.server_id, reason = %reason, "Stdio transport lost");
        }
        TransportError::Closed(reason)
    }

    async fn exchange(&self, id: u64, line: &[u8]) -> Result<Value, TransportError> {
        let mut wire = self.wire.lock().await;

        if wire.writing {
            return Err(self.mark_dead("an earlier request was cut off mid-write"));
        }
        wire.writing = true;
        if let Err(e) = wire.write_line(line).await {
            return Err(self.mark_dead(format!("write failed: {e}")));
        }
        wire.writing = false;

        loop {
            let raw = match wire.read_line().await {
                Ok(Some(raw)) => raw,
                Ok(None) => return Err(self.mark_dead("server closed stdout")),
                Err(e) => return Err(self.mark_dead(format!("read failed: {e}"))),
            };
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<JsonRpcResponse>(&raw) {
                Ok(message) => match message.response_id() {
                    Some(got) if got == id => return message.into_result(),
                    Some(got) => {
                        debug!(server = %self.server_id, id = got, expected = id, "Discarding stale response");
                    }
                    None => {
                        debug!(server = %self.server_id, method = ?message.method, "Ignoring server message");
                    }
                },
                Err(e) => {
                    warn!(server = %self.server_id, error = %e, "Skipping unparseable line from server");
                }
            }
        }
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::Closed("server process is gone".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push(b'\n');

        match tokio::time::timeout(timeout, self.exchange(id, &line)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(server = %self.server_id, id, method, "Request timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&JsonRpcRequest::notification(method, params))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let mut wire = self.wire.lock().await;
        if let Err(e) = wire.write_line(&line).await {
            return Err(self.mark_dead(format!("write failed: {e}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        protocol::list_tools(self, &self.server_id, self.request_timeout).await
    }

    async fn invoke(&self, call: &ToolCall, timeout: Duration) -> Result<Value, TransportError> {
        protocol::call_tool(self, call, timeout).await
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        match self.child.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => true,
            },
            Err(_) => false,
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let child = match self.child.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut child) = child {
            info!(server = %self.server_id, "Stopping stdio server");
            if let Err(e) = child.start_kill() {
                debug!(server = %self.server_id, error = %e, "Child already exited");
            }
            let _ = child.wait().await;
        }
    }
}

fn drain_stderr(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(server = %server_id, "stderr: {line}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(server = %server_id, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}
