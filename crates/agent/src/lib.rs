//! The Cortex agent: a bounded **Perceive → Plan → Act → Evaluate** loop.
//!
//! 1. **Perceive** the stimulus against the session history
//! 2. **Plan** a graph of tool calls (or answer directly)
//! 3. **Act**: dispatch independent steps together, dependent steps in order
//! 4. **Evaluate**: finalize, or plan again with the failures in view
//!
//! The loop stops at an answer or when `max_iterations` is exhausted, and
//! every turn is committed to the session store either way.

pub mod planner;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use planner::{CommandPlanner, LlmPlanner};
pub use strategy::{LoopState, StrategyLoop, TurnReport};
pub use worker::{SessionWorker, WorkerStats};
