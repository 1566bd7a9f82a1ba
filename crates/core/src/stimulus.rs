//! Stimuli in, final answers out.
//!
//! A `StimulusSource` delivers inbound events (at-least-once); an
//! `AnswerSink` takes the outcome of each turn back to the outside world.
//! Both sides are external collaborators; these traits are the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// An external event that triggers one turn for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    /// Identifies the logical event; duplicates share it
    pub stimulus_id: String,

    pub session_id: String,

    /// The inbound message text
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    pub received_at: DateTime<Utc>,
}

impl Stimulus {
    /// A stimulus with a fresh random id.
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), session_id, text)
    }

    pub fn with_id(
        stimulus_id: impl Into<String>,
        session_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stimulus_id: stimulus_id.into(),
            session_id: session_id.into(),
            text: text.into(),
            sender: None,
            received_at: Utc::now(),
        }
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// What a turn produced, addressed back to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub session_id: String,
    pub stimulus_id: String,
    #[serde(flatten)]
    pub outcome: AnswerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Answer(String),
    Failure(String),
}

impl FinalAnswer {
    pub fn text(&self) -> &str {
        match &self.outcome {
            AnswerOutcome::Answer(text) | AnswerOutcome::Failure(text) => text,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, AnswerOutcome::Failure(_))
    }
}

/// Delivers inbound stimuli.
#[async_trait]
pub trait StimulusSource: Send + Sync {
    /// Human-readable source name (e.g., "telegram_sse").
    fn name(&self) -> &str;

    /// Start receiving. Returns a receiver that yields stimuli until the
    /// source shuts down.
    async fn start(&self) -> std::result::Result<mpsc::Receiver<Stimulus>, ChannelError>;
}

/// Takes final answers to their destination. Delivery guarantees (retry,
/// rate limiting) belong to the implementation.
#[async_trait]
pub trait AnswerSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, answer: FinalAnswer) -> std::result::Result<(), ChannelError>;
}
