//! `cortex run` — the long-lived worker.
//!
//! Reads stimuli from the configured SSE stream and sends answers to the
//! configured sink. With `--stdin`, reads lines from the terminal and prints
//! answers instead.

use cortex_agent::SessionWorker;
use cortex_channels::{ChannelSink, SseStimulusSource, StdinStimulusSource, sinks};
use cortex_config::AppConfig;
use cortex_core::event::{DomainEvent, EventBus};
use cortex_core::stimulus::{AnswerSink, StimulusSource};
use cortex_memory::SessionStore;
use cortex_tools::MultiMcp;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{build_strategy, connect_tools, load_config, open_store};

pub async fn run(
    path: Option<PathBuf>,
    stdin: bool,
    session: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    let events = Arc::new(EventBus::default());

    let store = open_store(&config.session).await?;
    let mcp = Arc::new(connect_tools(&config, events.clone()).await?);
    let result = serve(&config, mcp.clone(), store, events, stdin, session).await;
    mcp.shutdown().await;
    result
}

async fn serve(
    config: &AppConfig,
    mcp: Arc<MultiMcp>,
    store: SessionStore,
    events: Arc<EventBus>,
    stdin: bool,
    session: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let strategy = Arc::new(build_strategy(config, mcp, store, events.clone())?);

    let mut printer = None;
    let (source, sink): (Box<dyn StimulusSource>, Arc<dyn AnswerSink>) = if stdin {
        let (sink, mut answers) = ChannelSink::new(16);
        printer = Some(tokio::spawn(async move {
            while let Some(answer) = answers.recv().await {
                println!("{}\n", answer.text());
            }
        }));
        eprintln!("Type a request and press Enter. `exit` or Ctrl+D to quit.\n");
        (Box::new(StdinStimulusSource::new(session)), Arc::new(sink))
    } else {
        (
            Box::new(SseStimulusSource::from_config(&config.stimulus)?),
            sinks::from_config(&config.sink)?,
        )
    };

    info!(
        source = source.name(),
        sink = sink.name(),
        planner = strategy.planner_name(),
        sessions = strategy.store().backend_name(),
        "Worker starting"
    );

    let watcher = tokio::spawn(log_events(events.subscribe()));
    let stimuli = source.start().await?;
    let worker = SessionWorker::new(strategy, sink).with_event_bus(events);

    tokio::select! {
        stats = worker.run(stimuli) => {
            info!(
                received = stats.received,
                completed = stats.completed,
                duplicates = stats.duplicates,
                errors = stats.errors,
                "Worker stopped"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    watcher.abort();
    if let Some(printer) = printer {
        finish_printer(printer).await;
    }
    Ok(())
}

/// Wait for the stdin answer printer; false when it panicked or was cancelled.
async fn finish_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Answer printer task failed");
            false
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<Arc<DomainEvent>>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event.as_ref() {
            DomainEvent::ConnectionStateChanged {
                server_id, state, ..
            } => info!(server = %server_id, %state, "Connection state changed"),
            DomainEvent::ToolDispatched {
                tool_name,
                server_id,
                status,
                duration_ms,
                ..
            } => debug!(
                tool = %tool_name,
                server = server_id.as_deref().unwrap_or("-"),
                ?status,
                duration_ms,
                "Tool dispatched"
            ),
            DomainEvent::StimulusReceived {
                session_id,
                stimulus_id,
                ..
            } => debug!(session = %session_id, stimulus = %stimulus_id, "Stimulus accepted"),
            DomainEvent::DuplicateStimulus {
                session_id,
                stimulus_id,
                ..
            } => info!(session = %session_id, stimulus = %stimulus_id, "Duplicate stimulus acknowledged"),
            DomainEvent::TurnCompleted {
                session_id,
                answered,
                iterations,
                ..
            } => debug!(session = %session_id, answered, iterations, "Turn completed"),
        }
    }
}
