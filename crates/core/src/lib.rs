//! # Cortex Core
//!
//! Domain types, traits, and error definitions for the Cortex agent runtime.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is a trait here (`ToolDispatcher`, `Planner`,
//! `SessionStorage`, `StimulusSource`, `AnswerSink`). Implementations live in
//! their respective crates, so the strategy loop can be tested against stub
//! dispatchers and in-memory storage.

pub mod error;
pub mod event;
pub mod plan;
pub mod planner;
pub mod server;
pub mod session;
pub mod stimulus;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result, ToolErrorKind};
pub use event::{DomainEvent, EventBus};
pub use plan::{Binding, Plan, PlanStep, StepOutcome};
pub use planner::{Evaluation, Intent, IterationRecord, Planner, PlanningContext};
pub use server::{ConnectionState, ServerConfig, TransportKind};
pub use session::{SessionState, SessionStorage, Turn, TurnOutcome};
pub use stimulus::{AnswerOutcome, AnswerSink, FinalAnswer, Stimulus, StimulusSource};
pub use tool::{ToolCall, ToolDescriptor, ToolDispatcher, ToolResult, ToolStatus};
