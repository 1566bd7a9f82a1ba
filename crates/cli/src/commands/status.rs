//! `cortex status` — show configuration and server liveness.

use cortex_config::{AppConfig, PlannerKind, SessionBackend, SinkKind};
use cortex_core::ConnectionState;
use cortex_core::event::EventBus;
use std::path::PathBuf;
use std::sync::Arc;

use super::{connect_tools, load_config};

pub async fn run(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path.clone().unwrap_or_else(AppConfig::config_path);
    let config = load_config(path.as_deref())?;

    let planner = match config.planner.kind {
        PlannerKind::Command => "command".to_string(),
        PlannerKind::Llm => format!("llm ({})", config.planner.model),
    };
    let backend = match config.session.backend {
        SessionBackend::File => "file",
        SessionBackend::Memory => "memory",
        SessionBackend::Sqlite => "sqlite",
    };
    let sink = match config.sink.kind {
        SinkKind::Log => "log".to_string(),
        SinkKind::Http => format!("http ({})", config.sink.url.as_deref().unwrap_or("-")),
    };

    println!("Cortex Status");
    println!("=============");
    println!("  Config:       {}", config_path.display());
    println!("  Planner:      {planner}");
    println!(
        "  API key:      {}",
        if config.has_api_key() { "set" } else { "not set" }
    );
    println!("  Iterations:   {}", config.agent.max_iterations);
    println!("  Call timeout: {}s", config.agent.call_timeout_secs);
    println!(
        "  Sessions:     {backend} ({})",
        config.session.resolved_path().display()
    );
    println!(
        "  Stimuli:      {}",
        config.stimulus.url.as_deref().unwrap_or("not configured")
    );
    println!("  Sink:         {sink}");

    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `cortex init` first");
    }

    if config.servers.is_empty() {
        println!("  ⚠️  No servers configured");
        return Ok(());
    }

    println!("\nServers");
    println!("-------");
    let mcp = match connect_tools(&config, Arc::new(EventBus::default())).await {
        Ok(mcp) => mcp,
        Err(e) => {
            println!("  ❌ {e}");
            return Err(e.into());
        }
    };

    for (id, state) in mcp.connection_states().await {
        let mark = match state {
            ConnectionState::Ready => "✅",
            ConnectionState::Connecting => "⏳",
            ConnectionState::Failed | ConnectionState::Closed => "❌",
        };
        let transport = config
            .server(&id)
            .map(|s| s.transport.to_string())
            .unwrap_or_default();
        let state = state.to_string();
        let tools = mcp.registry().tools_for(&id).len();
        println!("  {mark} {id:<16} {transport:<6} {state:<10} {tools} tool(s)");
    }
    for failure in mcp.startup_failures() {
        println!("     {failure}");
    }
    println!("\n  {} tool(s) registered", mcp.registry().len());

    mcp.shutdown().await;
    Ok(())
}
