//! MultiMcp — the dispatcher that owns every server connection.
//!
//! A call is resolved against the registry, validated against the tool's
//! schema, and handed to the owning connection's transport. Per-call
//! failures never escape as errors: they come back as failed `ToolResult`s.
//! A connection that died gets exactly one reconnect attempt per call.

use async_trait::async_trait;
use chrono::Utc;
use cortex_core::error::RegistryError;
use cortex_core::{
    ConnectionState, DomainEvent, EventBus, ServerConfig, ToolCall, ToolDescriptor, ToolDispatcher,
    ToolErrorKind, ToolResult,
};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::registry::ToolRegistry;
use crate::transport::{Connector, Transport, TransportError};

/// Slack on top of the caller's timeout before the dispatcher gives up on
/// a transport that does not enforce timeouts itself.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// A server that could not be brought up at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupFailure {
    pub server_id: String,
    pub stage: StartupStage,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Open,
    Discover,
}

impl std::fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self.stage {
            StartupStage::Open => "open",
            StartupStage::Discover => "discover",
        };
        write!(f, "{} ({stage}): {}", self.server_id, self.error)
    }
}

struct Slot {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
}

struct ServerConnection {
    config: ServerConfig,
    slot: RwLock<Slot>,
    /// Serializes reconnect attempts
    reconnect: Mutex<()>,
}

fn publish_state(events: Option<&EventBus>, server_id: &str, state: ConnectionState) {
    if let Some(bus) = events {
        bus.publish(DomainEvent::ConnectionStateChanged {
            server_id: server_id.to_string(),
            state,
            timestamp: Utc::now(),
        });
    }
}

impl ServerConnection {
    fn new(config: ServerConfig, state: ConnectionState, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            config,
            slot: RwLock::new(Slot { state, transport }),
            reconnect: Mutex::new(()),
        }
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    async fn state(&self) -> ConnectionState {
        self.slot.read().await.state
    }

    /// The live transport, if the connection is usable as is.
    async fn usable(&self) -> Result<Option<Arc<dyn Transport>>, String> {
        let slot = self.slot.read().await;
        match (slot.state, &slot.transport) {
            (ConnectionState::Closed, _) => Err(format!("server '{}' is closed", self.id())),
            (ConnectionState::Ready, Some(transport)) if transport.is_alive() => {
                Ok(Some(transport.clone()))
            }
            _ => Ok(None),
        }
    }

    /// A ready transport, reconnecting once if the connection has failed.
    async fn ready_transport(
        &self,
        connector: &dyn Connector,
        events: Option<&EventBus>,
    ) -> Result<Arc<dyn Transport>, String> {
        if let Some(transport) = self.usable().await? {
            return Ok(transport);
        }

        let _guard = self.reconnect.lock().await;
        // another caller may have reconnected while we waited
        if let Some(transport) = self.usable().await? {
            return Ok(transport);
        }

        let stale = {
            let mut slot = self.slot.write().await;
            slot.state = ConnectionState::Connecting;
            slot.transport.take()
        };
        publish_state(events, self.id(), ConnectionState::Connecting);
        if let Some(stale) = stale {
            stale.close().await;
        }

        info!(server = %self.id(), "Reconnecting");
        match connector.open(&self.config).await {
            Ok(transport) => {
                let mut slot = self.slot.write().await;
                if slot.state == ConnectionState::Closed {
                    drop(slot);
                    transport.close().await;
                    return Err(format!("server '{}' is closed", self.id()));
                }
                slot.state = ConnectionState::Ready;
                slot.transport = Some(transport.clone());
                drop(slot);
                publish_state(events, self.id(), ConnectionState::Ready);
                info!(server = %self.id(), "Reconnected");
                Ok(transport)
            }
            Err(e) => {
                self.slot.write().await.state = ConnectionState::Failed;
                publish_state(events, self.id(), ConnectionState::Failed);
                warn!(server = %self.id(), error = %e, "Reconnect failed");
                Err(format!("server '{}' is unavailable: {e}", self.id()))
            }
        }
    }

    /// Mark the connection failed if `transport` is still the current one.
    async fn mark_failed(&self, transport: &Arc<dyn Transport>, events: Option<&EventBus>) {
        let mut slot = self.slot.write().await;
        let current = slot
            .transport
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, transport));
        if current && slot.state == ConnectionState::Ready {
            slot.state = ConnectionState::Failed;
            drop(slot);
            warn!(server = %self.id(), "Connection marked failed");
            publish_state(events, self.id(), ConnectionState::Failed);
        }
    }

    async fn close(&self, events: Option<&EventBus>) {
        let transport = {
            let mut slot = self.slot.write().await;
            if slot.state == ConnectionState::Closed {
                return;
            }
            slot.state = ConnectionState::Closed;
            slot.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
        publish_state(events, self.id(), ConnectionState::Closed);
    }
}

/// Routes tool calls to the servers that own them.
pub struct MultiMcp {
    registry: Arc<ToolRegistry>,
    connections: HashMap<String, ServerConnection>,
    connector: Arc<dyn Connector>,
    configs: Vec<ServerConfig>,
    startup_failures: Vec<StartupFailure>,
    events: Option<Arc<EventBus>>,
}

impl MultiMcp {
    /// Open every server, discover its tools, and build the registry.
    ///
    /// Servers that fail to open or discover are reported in
    /// [`startup_failures`](Self::startup_failures) and left `failed`; a
    /// tool name served twice fails the whole call.
    pub async fn connect(
        configs: Vec<ServerConfig>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RegistryError> {
        let opened = join_all(
            configs
                .iter()
                .map(|config| open_and_discover(connector.as_ref(), config)),
        )
        .await;

        let mut connections = HashMap::new();
        let mut discovered = Vec::new();
        let mut startup_failures = Vec::new();

        for (config, outcome) in configs.iter().zip(opened) {
            let connection = match outcome {
                Ok((transport, tools)) => {
                    info!(
                        server = %config.id,
                        transport = %config.transport,
                        tools = tools.len(),
                        "Server ready"
                    );
                    discovered.extend(tools);
                    ServerConnection::new(config.clone(), ConnectionState::Ready, Some(transport))
                }
                Err(failure) => {
                    warn!(server = %config.id, error = %failure, "Server unavailable");
                    startup_failures.push(failure);
                    ServerConnection::new(config.clone(), ConnectionState::Failed, None)
                }
            };
            connections.insert(config.id.clone(), connection);
        }

        let registry = match ToolRegistry::build(discovered) {
            Ok(registry) => registry,
            Err(e) => {
                for connection in connections.values() {
                    connection.close(None).await;
                }
                return Err(e);
            }
        };

        info!(
            tools = registry.len(),
            servers = connections.len(),
            failed = startup_failures.len(),
            "Tool registry built"
        );

        Ok(Self {
            registry: Arc::new(registry),
            connections,
            connector,
            configs,
            startup_failures,
            events: None,
        })
    }

    /// Publish `ToolDispatched` and `ConnectionStateChanged` on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    fn events(&self) -> Option<&EventBus> {
        self.events.as_deref()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn startup_failures(&self) -> &[StartupFailure] {
        &self.startup_failures
    }

    /// Liveness of every configured server, in configuration order.
    pub async fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        let mut states = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            if let Some(connection) = self.connections.get(&config.id) {
                states.push((config.id.clone(), connection.state().await));
            }
        }
        states
    }

    /// Call a tool by name.
    pub async fn call(&self, tool_name: &str, arguments: Value, timeout: Duration) -> ToolResult {
        self.dispatch(ToolCall::new(tool_name, arguments), timeout).await
    }

    /// Execute a pre-built call.
    pub async fn dispatch(&self, call: ToolCall, timeout: Duration) -> ToolResult {
        let started = Instant::now();
        let (result, server_id) = self.route(&call, timeout, started).await;

        match &result.error {
            None => debug!(
                tool = %call.tool_name,
                server = server_id.as_deref().unwrap_or("-"),
                elapsed_ms = result.elapsed_ms,
                "Tool call succeeded"
            ),
            Some(failure) => info!(
                tool = %call.tool_name,
                server = server_id.as_deref().unwrap_or("-"),
                kind = %failure.kind,
                detail = %failure.detail,
                "Tool call failed"
            ),
        }

        if let Some(bus) = self.events() {
            bus.publish(DomainEvent::ToolDispatched {
                tool_name: call.tool_name.clone(),
                server_id,
                status: result.status,
                duration_ms: result.elapsed_ms,
                timestamp: Utc::now(),
            });
        }
        result
    }

    async fn route(
        &self,
        call: &ToolCall,
        timeout: Duration,
        started: Instant,
    ) -> (ToolResult, Option<String>) {
        let failed = |kind: ToolErrorKind, detail: String| {
            ToolResult::failed(call, kind, detail, started.elapsed())
        };

        let descriptor = match self.registry.resolve(&call.tool_name) {
            Ok(descriptor) => descriptor,
            Err(e) => return (failed(ToolErrorKind::UnknownTool, e.to_string()), None),
        };
        let server_id = Some(descriptor.server_id.clone());

        if let Err(e) = self.registry.validate_arguments(descriptor, &call.arguments) {
            return (failed(ToolErrorKind::InvalidArguments, e.to_string()), server_id);
        }

        let Some(connection) = self.connections.get(&descriptor.server_id) else {
            let detail = format!("no connection for server '{}'", descriptor.server_id);
            return (failed(ToolErrorKind::ConnectionUnavailable, detail), server_id);
        };

        let transport = match connection
            .ready_transport(self.connector.as_ref(), self.events())
            .await
        {
            Ok(transport) => transport,
            Err(detail) => return (failed(ToolErrorKind::ConnectionUnavailable, detail), server_id),
        };

        let outcome = match tokio::time::timeout(timeout + TIMEOUT_GRACE, transport.invoke(call, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let result = match outcome {
            Ok(payload) => ToolResult::ok(call, payload, started.elapsed()),
            Err(e) => {
                if e.is_fatal() || !transport.is_alive() {
                    connection.mark_failed(&transport, self.events()).await;
                }
                failed(e.kind(), e.to_string())
            }
        };
        (result, server_id)
    }

    /// Close everything and build a fresh dispatcher from the same
    /// configuration. The registry is never patched in place.
    pub async fn reload(&self) -> Result<MultiMcp, RegistryError> {
        info!("Reloading tool servers");
        self.shutdown().await;
        let next = Self::connect(self.configs.clone(), self.connector.clone()).await?;
        Ok(match &self.events {
            Some(bus) => next.with_event_bus(bus.clone()),
            None => next,
        })
    }

    /// Close every connection. Stdio children are killed.
    pub async fn shutdown(&self) {
        join_all(
            self.connections
                .values()
                .map(|connection| connection.close(self.events())),
        )
        .await;
        info!(servers = self.connections.len(), "Tool servers shut down");
    }
}

async fn open_and_discover(
    connector: &dyn Connector,
    config: &ServerConfig,
) -> Result<(Arc<dyn Transport>, Vec<ToolDescriptor>), StartupFailure> {
    let failure = |stage, error: TransportError| StartupFailure {
        server_id: config.id.clone(),
        stage,
        error: error.to_string(),
    };

    let transport = connector
        .open(config)
        .await
        .map_err(|e| failure(StartupStage::Open, e))?;

    match transport.discover().await {
        Ok(tools) => {
            let tools = tools
                .into_iter()
                .map(|mut descriptor| {
                    descriptor.server_id = config.id.clone();
                    descriptor
                })
                .collect();
            Ok((transport, tools))
        }
        Err(e) => {
            transport.close().await;
            Err(failure(StartupStage::Discover, e))
        }
    }
}

#[async_trait]
impl ToolDispatcher for MultiMcp {
    fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    async fn dispatch(&self, call: ToolCall, timeout: Duration) -> ToolResult {
        MultiMcp::dispatch(self, call, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::TransportKind;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockTransport {
        server_id: String,
        tools: Vec<ToolDescriptor>,
        alive: AtomicBool,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn server_id(&self) -> &str {
            &self.server_id
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn discover(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
            if self.server_id == "flaky_discovery" {
                return Err(TransportError::Protocol("tools/list exploded".into()));
            }
            Ok(self.tools.clone())
        }

        async fn invoke(&self, call: &ToolCall, _timeout: Duration) -> Result<Value, TransportError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let args = &call.arguments;
            match call.tool_name.as_str() {
                "add" => Ok(json!(args["a"].as_i64().unwrap() + args["b"].as_i64().unwrap())),
                // ignores its timeout entirely
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!(null))
                }
                "crash" => {
                    self.alive.store(false, Ordering::SeqCst);
                    Err(TransportError::Closed("server exited".into()))
                }
                "boom" => Err(TransportError::Rpc {
                    code: -32000,
                    message: "boom".into(),
                }),
                _ => Ok(args.clone()),
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockConnector {
        tools: HashMap<String, Vec<&'static str>>,
        unreachable: std::sync::Mutex<HashSet<String>>,
        opens: std::sync::Mutex<HashMap<String, usize>>,
        invocations: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn with(mut self, server: &str, tools: Vec<&'static str>) -> Self {
            self.tools.insert(server.to_string(), tools);
            self
        }

        fn set_unreachable(&self, server: &str, unreachable: bool) {
            let mut set = self.unreachable.lock().unwrap();
            if unreachable {
                set.insert(server.to_string());
            } else {
                set.remove(server);
            }
        }

        fn opens(&self, server: &str) -> usize {
            self.opens.lock().unwrap().get(server).copied().unwrap_or(0)
        }

        fn configs(&self) -> Vec<ServerConfig> {
            let mut ids: Vec<&String> = self.tools.keys().collect();
            ids.sort();
            ids.into_iter()
                .map(|id| ServerConfig::stdio(id.as_str(), "mock", vec![]))
                .collect()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
            *self.opens.lock().unwrap().entry(config.id.clone()).or_default() += 1;
            if self.unreachable.lock().unwrap().contains(&config.id) {
                return Err(TransportError::Open("connection refused".into()));
            }
            let tools = self
                .tools
                .get(&config.id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    server_id: "whatever".into(),
                    input_schema: if name == "add" {
                        json!({
                            "type": "object",
                            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                            "required": ["a", "b"]
                        })
                    } else {
                        json!({"type": "object"})
                    },
                    description: String::new(),
                })
                .collect();
            Ok(Arc::new(MockTransport {
                server_id: config.id.clone(),
                tools,
                alive: AtomicBool::new(true),
                invocations: self.invocations.clone(),
            }))
        }
    }

    async fn dispatcher(connector: MockConnector) -> (MultiMcp, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let mcp = MultiMcp::connect(connector.configs(), connector.clone())
            .await
            .unwrap();
        (mcp, connector)
    }

    fn standard() -> MockConnector {
        MockConnector::default()
            .with("math", vec!["add", "hang", "crash", "boom"])
            .with("docs", vec!["search_documents"])
    }

    const T: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn routes_calls_to_the_owning_server() {
        let (mcp, _) = dispatcher(standard()).await;
        let result = mcp.call("add", json!({"a": 2, "b": 3}), T).await;
        assert!(result.is_ok());
        assert_eq!(result.payload, Some(json!(5)));

        let result = mcp.call("search_documents", json!({"q": "invoice"}), T).await;
        assert_eq!(result.payload, Some(json!({"q": "invoice"})));

        assert_eq!(mcp.registry().resolve("add").unwrap().server_id, "math");
        assert_eq!(ToolDispatcher::tools(&mcp).len(), 5);
    }

    #[tokio::test]
    async fn unknown_tool_never_touches_a_transport() {
        let (mcp, connector) = dispatcher(standard()).await;
        let result = mcp.call("unknown_fn", json!({}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::UnknownTool));
        assert_eq!(connector.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_violations_are_invalid_arguments() {
        let (mcp, connector) = dispatcher(standard()).await;
        let result = mcp.call("add", json!({"a": 2}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::InvalidArguments));
        let result = mcp.call("add", json!({"a": "2", "b": 3}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::InvalidArguments));
        assert_eq!(connector.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tool_level_errors_are_execution_failures() {
        let (mcp, _) = dispatcher(standard()).await;
        let result = mcp.call("boom", json!({}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ExecutionFailed));
        let states = mcp.connection_states().await;
        assert!(states.iter().all(|(_, s)| *s == ConnectionState::Ready));
    }

    #[tokio::test]
    async fn duplicate_names_fail_connect() {
        let connector = Arc::new(
            MockConnector::default()
                .with("docs", vec!["search"])
                .with("web", vec!["search"]),
        );
        let err = MultiMcp::connect(connector.configs(), connector.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Conflict { ref tool, .. } if tool == "search"));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_not_fatal() {
        let connector = standard().with("gmail", vec!["send_email"]);
        connector.set_unreachable("gmail", true);
        let (mcp, _) = dispatcher(connector).await;

        assert_eq!(mcp.startup_failures().len(), 1);
        assert_eq!(mcp.startup_failures()[0].server_id, "gmail");
        assert_eq!(mcp.startup_failures()[0].stage, StartupStage::Open);
        assert!(mcp.registry().resolve("send_email").is_err());
        assert!(mcp.call("add", json!({"a": 1, "b": 1}), T).await.is_ok());

        let states: HashMap<_, _> = mcp.connection_states().await.into_iter().collect();
        assert_eq!(states["gmail"], ConnectionState::Failed);
        assert_eq!(states["math"], ConnectionState::Ready);
    }

    #[tokio::test]
    async fn discovery_failure_drops_only_that_server() {
        let (mcp, _) = dispatcher(standard().with("flaky_discovery", vec!["ghost"])).await;
        assert_eq!(mcp.startup_failures()[0].stage, StartupStage::Discover);
        assert!(mcp.registry().resolve("ghost").is_err());
        assert!(mcp.registry().resolve("add").is_ok());
    }

    #[tokio::test]
    async fn timeout_is_bounded_and_isolated() {
        let (mcp, _) = dispatcher(standard()).await;
        let started = Instant::now();
        let (slow, fast) = tokio::join!(
            mcp.call("hang", json!({}), Duration::from_millis(100)),
            mcp.call("search_documents", json!({"q": "x"}), T),
        );
        assert_eq!(slow.error_kind(), Some(ToolErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(fast.is_ok());
        assert!(fast.elapsed_ms < 100);
    }

    #[tokio::test]
    async fn dead_connection_gets_one_reconnect() {
        let (mcp, connector) = dispatcher(standard()).await;
        let result = mcp.call("crash", json!({}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::TransportFailure));
        let states: HashMap<_, _> = mcp.connection_states().await.into_iter().collect();
        assert_eq!(states["math"], ConnectionState::Failed);

        // reconnect succeeds
        let result = mcp.call("add", json!({"a": 1, "b": 2}), T).await;
        assert_eq!(result.payload, Some(json!(3)));
        assert_eq!(connector.opens("math"), 2);

        // kill it again, this time the server stays down
        mcp.call("crash", json!({}), T).await;
        connector.set_unreachable("math", true);
        let result = mcp.call("add", json!({"a": 1, "b": 2}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ConnectionUnavailable));
        assert_eq!(connector.opens("math"), 3);

        let result = mcp.call("add", json!({"a": 1, "b": 2}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ConnectionUnavailable));
        assert_eq!(connector.opens("math"), 4);
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let (mcp, connector) = dispatcher(standard()).await;
        mcp.shutdown().await;
        let states = mcp.connection_states().await;
        assert!(states.iter().all(|(_, s)| *s == ConnectionState::Closed));

        let result = mcp.call("add", json!({"a": 1, "b": 2}), T).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ConnectionUnavailable));
        assert_eq!(connector.opens("math"), 1);
    }

    #[tokio::test]
    async fn reload_rebuilds_from_configuration() {
        let (mcp, connector) = dispatcher(standard()).await;
        let reloaded = mcp.reload().await.unwrap();
        assert_eq!(connector.opens("math"), 2);
        assert!(reloaded.call("add", json!({"a": 2, "b": 2}), T).await.is_ok());
        let old: Vec<_> = mcp.connection_states().await;
        assert!(old.iter().all(|(_, s)| *s == ConnectionState::Closed));
    }

    #[tokio::test]
    async fn dispatch_publishes_events() {
        let (mcp, _) = dispatcher(standard()).await;
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let mcp = mcp.with_event_bus(bus);

        mcp.call("add", json!({"a": 1, "b": 1}), T).await;
        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolDispatched { tool_name, server_id, .. } => {
                assert_eq!(tool_name, "add");
                assert_eq!(server_id.as_deref(), Some("math"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        mcp.call("crash", json!({}), T).await;
        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let DomainEvent::ConnectionStateChanged { state, .. } = event.as_ref() {
                saw_failed |= *state == ConnectionState::Failed;
            }
        }
        assert!(saw_failed);
    }
}
