//! `cortex ask` — run one turn in a session and print the outcome.

use cortex_core::event::EventBus;
use cortex_core::stimulus::Stimulus;
use std::path::PathBuf;
use std::sync::Arc;

use super::{build_strategy, connect_tools, load_config, open_store};

pub async fn run(
    path: Option<PathBuf>,
    message: String,
    session: String,
    trace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    let events = Arc::new(EventBus::default());

    let store = open_store(&config.session).await?;
    let mcp = Arc::new(connect_tools(&config, events.clone()).await?);
    let strategy = match build_strategy(&config, mcp.clone(), store, events) {
        Ok(strategy) => strategy,
        Err(e) => {
            mcp.shutdown().await;
            return Err(e.into());
        }
    };

    let stimulus = Stimulus::new(session, message).from_sender("local_user");
    let report = strategy.run_turn(&stimulus).await;
    mcp.shutdown().await;
    let report = report?;

    println!("{}", report.text());
    if trace {
        let states: Vec<String> = report.trace.iter().map(ToString::to_string).collect();
        eprintln!(
            "\n  session {} turn {} · {} iteration(s) · {}",
            report.session_id,
            report.turn_index,
            report.iterations,
            states.join(" → ")
        );
    }

    if report.answer().is_none() {
        let reason = match report.final_state() {
            Some(state) => format!("turn ended in {state}"),
            None => format!("stimulus {} was already handled", report.stimulus_id),
        };
        return Err(reason.into());
    }
    Ok(())
}
