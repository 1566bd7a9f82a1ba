//! `cortex tools` — list the merged tool registry.

use cortex_core::event::EventBus;
use std::path::PathBuf;
use std::sync::Arc;

use super::{connect_tools, load_config};

pub async fn run(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    let mcp = connect_tools(&config, Arc::new(EventBus::default())).await?;

    let tools = mcp.registry().descriptors();
    if tools.is_empty() {
        println!("No tools available.");
    }
    for tool in &tools {
        if tool.description.is_empty() {
            println!("{}  [{}]", tool.name, tool.server_id);
        } else {
            println!("{}  [{}]  {}", tool.name, tool.server_id, tool.description);
        }
    }
    for failure in mcp.startup_failures() {
        eprintln!("unavailable: {failure}");
    }

    mcp.shutdown().await;
    Ok(())
}
