//! Session state — the per-conversation history the strategy loop works on.
//!
//! A session is an append-only list of turns plus a small scratch map of
//! working variables. The storage *medium* is abstracted behind
//! `SessionStorage`; the record format lives in the memory crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MemoryError;
use crate::tool::ToolResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,

    /// Committed turns, strictly ordered by index
    #[serde(default)]
    pub turns: Vec<Turn>,

    /// Working variables, overwritten in place
    #[serde(default)]
    pub scratch: BTreeMap<String, serde_json::Value>,

    /// Set when a turn has started but not been committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<InProgressTurn>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turns: vec![],
            scratch: BTreeMap::new(),
            in_progress: None,
        }
    }

    /// Index the next appended turn must carry.
    pub fn next_turn_index(&self) -> usize {
        self.turns.len()
    }

    /// Whether a turn for this stimulus has already been committed.
    pub fn has_stimulus(&self, stimulus_id: &str) -> bool {
        self.turns.iter().any(|t| t.stimulus_id == stimulus_id)
    }

    /// The last `n` turns, oldest first.
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressTurn {
    pub stimulus_id: String,
    pub started_at: DateTime<Utc>,
}

/// One complete PERCEIVE → ... → DONE/FAILED cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub stimulus_id: String,
    pub stimulus: String,

    /// One summary per PLAN iteration
    #[serde(default)]
    pub plans: Vec<Vec<String>>,

    #[serde(default)]
    pub tool_results: Vec<ToolResult>,

    pub outcome: TurnOutcome,
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl Turn {
    /// The final answer, if the turn reached DONE.
    pub fn final_answer(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Answered { answer } => Some(answer),
            TurnOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered {
        answer: String,
    },
    Failed {
        kind: TurnFailureKind,
        detail: String,
        /// Summary of every step attempted across iterations
        #[serde(default)]
        attempted: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnFailureKind {
    /// The iteration bound was reached without a final answer.
    PlanExhausted,
}

impl std::fmt::Display for TurnFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanExhausted => f.write_str("plan_exhausted"),
        }
    }
}

/// Durable key-value storage for serialized session records.
///
/// Implementations: in-memory, file-per-session, SQLite.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// The backend name (e.g., "file", "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Read the raw record for a session, if any.
    async fn read(&self, session_id: &str) -> std::result::Result<Option<String>, MemoryError>;

    /// Durably replace the record for a session. Must not return before the
    /// write is complete.
    async fn write(&self, session_id: &str, record: &str) -> std::result::Result<(), MemoryError>;

    /// All session ids with a stored record.
    async fn list(&self) -> std::result::Result<Vec<String>, MemoryError>;
}
