//! Subcommand implementations and the wiring they share.

pub mod ask;
pub mod init;
pub mod run;
pub mod session;
pub mod status;
pub mod tools;

use cortex_agent::StrategyLoop;
use cortex_agent::planner;
use cortex_config::{AppConfig, SessionBackend, SessionConfig};
use cortex_core::error::{MemoryError, PlannerError, RegistryError};
use cortex_core::event::EventBus;
use cortex_core::{SessionStorage, ToolDispatcher};
use cortex_memory::{FileStorage, InMemoryStorage, SessionStore, SqliteStorage};
use cortex_tools::{McpConnector, MultiMcp};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let loaded = match path {
        Some(path) => AppConfig::load_at(path),
        None => AppConfig::load(),
    };
    loaded.map_err(|e| format!("Failed to load config: {e}").into())
}

/// Open the session store selected by `[session]`.
pub async fn open_store(config: &SessionConfig) -> Result<SessionStore, MemoryError> {
    let storage: Arc<dyn SessionStorage> = match config.backend {
        SessionBackend::Memory => Arc::new(InMemoryStorage::new()),
        SessionBackend::File => Arc::new(FileStorage::new(config.resolved_path())),
        SessionBackend::Sqlite => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::Storage(format!("{}: {e}", parent.display())))?;
            }
            Arc::new(SqliteStorage::new(&path.to_string_lossy()).await?)
        }
    };
    Ok(SessionStore::new(storage))
}

/// Connect every configured server and build the registry.
///
/// Unreachable servers are logged and left out; a duplicate tool name is an
/// error.
pub async fn connect_tools(
    config: &AppConfig,
    events: Arc<EventBus>,
) -> Result<MultiMcp, RegistryError> {
    let connector = McpConnector::new().with_request_timeout(config.agent.call_timeout());
    let mcp = MultiMcp::connect(config.servers.clone(), Arc::new(connector))
        .await
        .inspect_err(|e| error!(error = %e, "Tool registry could not be built"))?;
    for failure in mcp.startup_failures() {
        warn!(%failure, "Server left out of the registry");
    }
    Ok(mcp.with_event_bus(events))
}

/// The strategy loop with the configured planner and bounds.
pub fn build_strategy(
    config: &AppConfig,
    dispatcher: Arc<dyn ToolDispatcher>,
    store: SessionStore,
    events: Arc<EventBus>,
) -> Result<StrategyLoop, PlannerError> {
    let planner = planner::from_config(config)?;
    Ok(StrategyLoop::new(planner, dispatcher, store)
        .with_max_iterations(config.agent.max_iterations)
        .with_call_timeout(config.agent.call_timeout())
        .with_event_bus(events))
}
