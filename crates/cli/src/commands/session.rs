//! `cortex session` — inspect stored sessions.

use cortex_core::{ToolStatus, TurnOutcome};
use std::path::PathBuf;

use super::{load_config, open_store};

pub async fn list(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    let store = open_store(&config.session).await?;

    let sessions = store.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions stored ({}).", store.backend_name());
    }
    for session_id in sessions {
        println!("{session_id}");
    }
    Ok(())
}

pub async fn show(
    path: Option<PathBuf>,
    session_id: String,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    let store = open_store(&config.session).await?;
    let state = store.load(&session_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    if state.turns.is_empty() {
        println!("Session '{session_id}' has no turns.");
        return Ok(());
    }

    println!("Session {session_id} · {} turn(s)", state.turns.len());
    for turn in &state.turns {
        println!(
            "\n#{} [{}] {}",
            turn.index,
            turn.completed_at.format("%Y-%m-%d %H:%M:%S"),
            turn.stimulus
        );
        for result in &turn.tool_results {
            match (&result.status, &result.error) {
                (ToolStatus::Error, Some(failure)) => {
                    println!("   ✗ {} {}: {}", result.tool_name, failure.kind, failure.detail)
                }
                _ => println!("   ✓ {} ({} ms)", result.tool_name, result.elapsed_ms),
            }
        }
        match &turn.outcome {
            TurnOutcome::Answered { answer } => println!("   → {answer}"),
            TurnOutcome::Failed { kind, detail, .. } => {
                println!("   ✗ {kind} after {} iteration(s): {detail}", turn.iterations)
            }
        }
    }

    if !state.scratch.is_empty() {
        println!("\nScratch:");
        for (key, value) in &state.scratch {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}
