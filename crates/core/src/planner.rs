//! Planner trait — the decision-making half of the strategy loop.
//!
//! The loop owns the state machine; a `Planner` supplies the PERCEIVE, PLAN
//! and EVALUATE decisions. Implementations range from a deterministic
//! command parser to a remote language model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::PlannerError;
use crate::plan::{Plan, StepOutcome, render_answer};
use crate::session::SessionState;
use crate::stimulus::Stimulus;
use crate::tool::{ToolDescriptor, ToolResult, render_payload};

/// Structured summary produced by PERCEIVE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// What the user wants, in the planner's words
    pub goal: String,

    /// Tool names the perceiver thinks are relevant
    #[serde(default)]
    pub tool_hints: Vec<String>,

    /// Prior exchanges in this session, oldest first
    #[serde(default)]
    pub context: Vec<String>,
}

impl Intent {
    /// The trivial perception: the stimulus text is the goal and the last
    /// few turns are context.
    pub fn from_stimulus(stimulus: &Stimulus, session: &SessionState, history: usize) -> Self {
        let context = session
            .recent_turns(history)
            .iter()
            .map(|turn| match turn.final_answer() {
                Some(answer) => format!("user: {} / answer: {}", turn.stimulus, answer),
                None => format!("user: {} / (failed)", turn.stimulus),
            })
            .collect();
        Self {
            goal: stimulus.text.trim().to_string(),
            tool_hints: vec![],
            context,
        }
    }
}

/// One executed PLAN → ACT round.
#[derive(Debug, Clone, Default)]
pub struct IterationRecord {
    pub iteration: u32,
    pub plan: Plan,
    /// Step ids in the order they were settled
    pub order: Vec<String>,
    pub table: HashMap<String, StepOutcome>,
    /// Failed steps whose result a branch condition inspected
    pub handled: BTreeSet<String>,
    /// Set when PLAN itself failed
    pub planner_error: Option<String>,
}

impl IterationRecord {
    /// Outcomes in settlement order.
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &StepOutcome)> {
        self.order
            .iter()
            .filter_map(|id| self.table.get(id).map(|o| (id.as_str(), o)))
    }

    /// Every tool result produced in this iteration.
    pub fn results(&self) -> impl Iterator<Item = &ToolResult> {
        self.outcomes().filter_map(|(_, o)| match o {
            StepOutcome::Completed(result) => Some(result),
            _ => None,
        })
    }

    /// Human-readable lines for failed or skipped steps.
    pub fn problems(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .outcomes()
            .filter_map(|(id, outcome)| match outcome {
                StepOutcome::Completed(result) if !result.is_ok() && !self.handled.contains(id) => {
                    Some(format!("{id}: {}", result.summary()))
                }
                StepOutcome::SkippedDueToDependency { dependency } => {
                    Some(format!("{id}: skipped_due_to_dependency on {dependency}"))
                }
                _ => None,
            })
            .collect();
        if let Some(err) = &self.planner_error {
            problems.push(format!("planner: {err}"));
        }
        problems
    }

    pub fn is_clean(&self) -> bool {
        self.planner_error.is_none()
            && self
                .outcomes()
                .all(|(id, o)| o.is_success() || self.handled.contains(id))
    }
}

/// Everything a planner may look at.
pub struct PlanningContext<'a> {
    pub stimulus: &'a Stimulus,
    pub session: &'a SessionState,
    pub intent: &'a Intent,
    pub tools: &'a [ToolDescriptor],
    /// Earlier iterations of this turn
    pub history: &'a [IterationRecord],
    /// 1-based
    pub iteration: u32,
    pub max_iterations: u32,
}

/// EVALUATE's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Finalize(String),
    Replan { reason: String },
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// PERCEIVE: read-only interpretation of the stimulus.
    async fn perceive(
        &self,
        stimulus: &Stimulus,
        session: &SessionState,
    ) -> std::result::Result<Intent, PlannerError> {
        Ok(Intent::from_stimulus(stimulus, session, 3))
    }

    /// PLAN: produce this iteration's plan.
    async fn plan(&self, ctx: &PlanningContext<'_>) -> std::result::Result<Plan, PlannerError>;

    /// EVALUATE: decide whether `current` answers the stimulus.
    async fn evaluate(
        &self,
        _ctx: &PlanningContext<'_>,
        current: &IterationRecord,
    ) -> std::result::Result<Evaluation, PlannerError> {
        Ok(default_evaluation(current))
    }
}

/// Finalize when every step succeeded, otherwise ask for another plan.
pub fn default_evaluation(current: &IterationRecord) -> Evaluation {
    if !current.is_clean() {
        return Evaluation::Replan {
            reason: current.problems().join("; "),
        };
    }
    if let Some(template) = &current.plan.answer {
        return Evaluation::Finalize(render_answer(template, &current.table));
    }
    let payloads: Vec<String> = current
        .results()
        .filter_map(|r| r.payload.as_ref().map(render_payload))
        .collect();
    if payloads.is_empty() {
        Evaluation::Replan {
            reason: "plan produced neither steps nor an answer".into(),
        }
    } else {
        Evaluation::Finalize(payloads.join("\n"))
    }
}
