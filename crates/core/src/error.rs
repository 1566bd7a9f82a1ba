//! Error types for the Cortex domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Cortex operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Registry errors (fatal at startup) ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Planner errors ---
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Per-call failure kinds carried inside a failed `ToolResult`.
///
/// None of these abort a turn: they are fed back into the next PLAN iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    #[error("unknown_tool")]
    UnknownTool,

    #[error("invalid_arguments")]
    InvalidArguments,

    #[error("connection_unavailable")]
    ConnectionUnavailable,

    #[error("timeout")]
    Timeout,

    #[error("transport_failure")]
    TransportFailure,

    /// The backend executed the tool and reported a tool-level error.
    #[error("execution_failed")]
    ExecutionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry_build_conflict: tool '{tool}' is exposed by both '{first_server}' and '{second_server}'")]
    Conflict {
        tool: String,
        first_server: String,
        second_server: String,
    },

    #[error("Tool not found: {0}")]
    NotFound(String),
}

/// Argument validation failure against a tool's input schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{name}' must be of type {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("unexpected parameter '{0}'")]
    UnexpectedParameter(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted session record for '{session_id}': {reason}")]
    Corrupted { session_id: String, reason: String },

    #[error("Unsupported session record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Turn out of order for '{session_id}': expected index {expected}, got {got}")]
    TurnOutOfOrder {
        session_id: String,
        expected: usize,
        got: usize,
    },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Delivery failed to {sink}: {reason}")]
    DeliveryFailed { sink: String, reason: String },

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Error)]
pub enum PlannerError {
    #[error("Planner backend failed: {0}")]
    Backend(String),

    #[error("Planner produced an invalid plan: {0}")]
    MalformedPlan(String),

    #[error("Planner not configured: {0}")]
    NotConfigured(String),
}
