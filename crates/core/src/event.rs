//! Runtime events: stimuli accepted, tools dispatched, connections changing
//! state, turns completing.
//!
//! Publishing never blocks and never fails; with nobody listening an event
//! is simply dropped. The `cortex run` command subscribes and logs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::server::ConnectionState;
use crate::tool::ToolStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A stimulus was accepted for processing
    StimulusReceived {
        session_id: String,
        stimulus_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A redelivered stimulus was acknowledged without running the loop
    DuplicateStimulus {
        session_id: String,
        stimulus_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool call finished (successfully or not)
    ToolDispatched {
        tool_name: String,
        server_id: Option<String>,
        status: ToolStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A server connection changed liveness
    ConnectionStateChanged {
        server_id: String,
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached DONE or FAILED
    TurnCompleted {
        session_id: String,
        stimulus_id: String,
        answered: bool,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out of [`DomainEvent`]s over a `tokio::sync::broadcast` channel.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Subscribers that fall more than `capacity` events behind skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
