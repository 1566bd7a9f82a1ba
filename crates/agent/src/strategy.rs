//! The strategy loop — one PERCEIVE → PLAN → ACT → EVALUATE cycle per stimulus.
//!
//! The loop owns the state machine and the per-turn result table; the
//! [`Planner`] makes the decisions and the [`ToolDispatcher`] runs the calls.
//!
//! ACT walks the plan in declared order. Consecutive call steps whose
//! references are already settled go out together as one batch; a step that
//! needs a result from the open batch flushes it first. References are
//! resolved against the table at the moment the batch is dispatched.

use chrono::Utc;
use cortex_core::error::ToolErrorKind;
use cortex_core::event::{DomainEvent, EventBus};
use cortex_core::plan::{CallStep, PlanStep, StepOutcome};
use cortex_core::planner::{Evaluation, Intent, IterationRecord, Planner, PlanningContext};
use cortex_core::session::{TurnFailureKind, TurnOutcome};
use cortex_core::stimulus::{AnswerOutcome, FinalAnswer, Stimulus};
use cortex_core::tool::{ToolCall, ToolDispatcher, ToolResult};
use cortex_core::Turn;
use cortex_memory::SessionStore;
use futures::future::{BoxFuture, FutureExt, join_all};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Turns of history handed to PERCEIVE when the planner's own perception fails.
const FALLBACK_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Perceive,
    Plan,
    Act,
    Evaluate,
    Done,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Perceive => "PERCEIVE",
            Self::Plan => "PLAN",
            Self::Act => "ACT",
            Self::Evaluate => "EVALUATE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What one call to [`StrategyLoop::run_turn`] produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub session_id: String,
    pub stimulus_id: String,
    pub turn_index: usize,
    pub outcome: TurnOutcome,
    pub iterations: u32,
    /// States visited, in order; empty for duplicates
    pub trace: Vec<LoopState>,
    /// The stimulus had already been committed; nothing ran
    pub duplicate: bool,
}

impl TurnReport {
    fn duplicate(stimulus: &Stimulus, previous: &Turn) -> Self {
        Self {
            session_id: stimulus.session_id.clone(),
            stimulus_id: stimulus.stimulus_id.clone(),
            turn_index: previous.index,
            outcome: previous.outcome.clone(),
            iterations: previous.iterations,
            trace: vec![],
            duplicate: true,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Answered { answer } => Some(answer),
            TurnOutcome::Failed { .. } => None,
        }
    }

    pub fn final_state(&self) -> Option<LoopState> {
        self.trace.last().copied()
    }

    /// The user-facing text, including the attempted steps for a failure.
    pub fn text(&self) -> String {
        match &self.outcome {
            TurnOutcome::Answered { answer } => answer.clone(),
            TurnOutcome::Failed {
                kind,
                detail,
                attempted,
            } => {
                let mut text = format!("{kind} after {} iteration(s): {detail}", self.iterations);
                if !attempted.is_empty() {
                    text.push_str("\nAttempted:");
                    for line in attempted {
                        text.push_str("\n- ");
                        text.push_str(line);
                    }
                }
                text
            }
        }
    }

    pub fn to_final_answer(&self) -> FinalAnswer {
        let outcome = match &self.outcome {
            TurnOutcome::Answered { answer } => AnswerOutcome::Answer(answer.clone()),
            TurnOutcome::Failed { .. } => AnswerOutcome::Failure(self.text()),
        };
        FinalAnswer {
            session_id: self.session_id.clone(),
            stimulus_id: self.stimulus_id.clone(),
            outcome,
        }
    }
}

/// Step outcomes of one ACT phase, in settlement order.
struct ResultTable {
    declared: HashSet<String>,
    order: Vec<String>,
    outcomes: HashMap<String, StepOutcome>,
    handled: BTreeSet<String>,
}

impl ResultTable {
    fn new(steps: &[PlanStep]) -> Self {
        let mut declared = HashSet::new();
        collect_ids(steps, &mut declared);
        Self {
            declared,
            order: vec![],
            outcomes: HashMap::new(),
            handled: BTreeSet::new(),
        }
    }

    fn settle(&mut self, id: &str, outcome: StepOutcome) {
        if self.outcomes.insert(id.to_string(), outcome).is_none() {
            self.order.push(id.to_string());
        }
    }

    /// The first dependency that failed, was skipped, or never ran.
    fn blocking_dependency(&self, deps: &BTreeSet<String>) -> Option<String> {
        deps.iter()
            .find(|dep| match self.outcomes.get(dep.as_str()) {
                Some(outcome) => !outcome.is_success(),
                None => self.declared.contains(dep.as_str()),
            })
            .cloned()
    }
}

fn collect_ids(steps: &[PlanStep], ids: &mut HashSet<String>) {
    for step in steps {
        ids.insert(step.id().to_string());
        if let PlanStep::Branch(branch) = step {
            collect_ids(&branch.then, ids);
            collect_ids(&branch.otherwise, ids);
        }
    }
}

/// Drives turns for any session. Stateless between turns apart from the
/// store; the caller guarantees one active turn per session id.
pub struct StrategyLoop {
    planner: Arc<dyn Planner>,
    dispatcher: Arc<dyn ToolDispatcher>,
    store: SessionStore,
    max_iterations: u32,
    call_timeout: Duration,
    events: Option<Arc<EventBus>>,
}

impl StrategyLoop {
    pub fn new(
        planner: Arc<dyn Planner>,
        dispatcher: Arc<dyn ToolDispatcher>,
        store: SessionStore,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            store,
            max_iterations: 5,
            call_timeout: Duration::from_secs(30),
            events: None,
        }
    }

    /// Bound on PLAN iterations per turn (at least 1).
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn planner_name(&self) -> &str {
        self.planner.name()
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Run one turn for `stimulus` and commit it to the session store.
    ///
    /// A stimulus already committed for its session is acknowledged without
    /// running anything. Errors are store failures only; everything that
    /// goes wrong inside the loop ends up in the turn outcome.
    pub async fn run_turn(&self, stimulus: &Stimulus) -> cortex_core::Result<TurnReport> {
        let started_at = Utc::now();
        let session = self.store.load(&stimulus.session_id).await?;

        if let Some(previous) = session
            .turns
            .iter()
            .find(|turn| turn.stimulus_id == stimulus.stimulus_id)
        {
            debug!(
                session = %stimulus.session_id,
                stimulus = %stimulus.stimulus_id,
                "Duplicate stimulus acknowledged"
            );
            self.publish(DomainEvent::DuplicateStimulus {
                session_id: stimulus.session_id.clone(),
                stimulus_id: stimulus.stimulus_id.clone(),
                timestamp: Utc::now(),
            });
            return Ok(TurnReport::duplicate(stimulus, previous));
        }

        self.store
            .begin_turn(&stimulus.session_id, &stimulus.stimulus_id)
            .await?;

        info!(
            session = %stimulus.session_id,
            stimulus = %stimulus.stimulus_id,
            planner = %self.planner.name(),
            "Starting turn"
        );

        let mut trace = vec![LoopState::Perceive];
        let intent = match self.planner.perceive(stimulus, &session).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(session = %stimulus.session_id, error = %e, "Perceive failed, using the raw stimulus");
                Intent::from_stimulus(stimulus, &session, FALLBACK_HISTORY)
            }
        };

        let tools = self.dispatcher.tools();
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut answer = None;
        let mut last_reason = String::new();
        let mut scratch_writes: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        for iteration in 1..=self.max_iterations {
            let ctx = PlanningContext {
                stimulus,
                session: &session,
                intent: &intent,
                tools: &tools,
                history: &history,
                iteration,
                max_iterations: self.max_iterations,
            };

            trace.push(LoopState::Plan);
            let mut record = IterationRecord {
                iteration,
                ..Default::default()
            };
            let planned = self
                .planner
                .plan(&ctx)
                .await
                .and_then(|plan| plan.validate().map(|()| plan));
            match planned {
                Ok(plan) => {
                    debug!(iteration, steps = plan.steps.len(), "Plan ready");
                    trace.push(LoopState::Act);
                    let mut table = ResultTable::new(&plan.steps);
                    self.execute(&plan.steps, &mut table).await;
                    for (key, binding) in &plan.remember {
                        match binding.resolve(&table.outcomes) {
                            Ok(value) => {
                                scratch_writes.insert(key.clone(), value);
                            }
                            Err(e) => warn!(iteration, key = %key, error = %e, "Scratch value not resolved"),
                        }
                    }
                    record.plan = plan;
                    record.order = table.order;
                    record.table = table.outcomes;
                    record.handled = table.handled;
                }
                Err(e) => {
                    warn!(iteration, error = %e, "Planner failed");
                    record.planner_error = Some(e.to_string());
                }
            }

            trace.push(LoopState::Evaluate);
            let verdict = if record.planner_error.is_some() {
                Evaluation::Replan {
                    reason: record.problems().join("; "),
                }
            } else {
                match self.planner.evaluate(&ctx, &record).await {
                    Ok(verdict) => verdict,
                    Err(e) => Evaluation::Replan {
                        reason: format!("evaluation failed: {e}"),
                    },
                }
            };
            history.push(record);

            match verdict {
                Evaluation::Finalize(text) => {
                    answer = Some(text);
                    break;
                }
                Evaluation::Replan { reason } => {
                    debug!(iteration, reason = %reason, "Re-planning");
                    last_reason = reason;
                }
            }
        }

        let iterations = u32::try_from(history.len()).unwrap_or(u32::MAX);
        let outcome = match answer {
            Some(answer) => {
                trace.push(LoopState::Done);
                TurnOutcome::Answered { answer }
            }
            None => {
                trace.push(LoopState::Failed);
                warn!(
                    session = %stimulus.session_id,
                    iterations,
                    reason = %last_reason,
                    "Plan exhausted"
                );
                TurnOutcome::Failed {
                    kind: TurnFailureKind::PlanExhausted,
                    detail: last_reason,
                    attempted: attempted_steps(&history),
                }
            }
        };

        let turn = Turn {
            index: session.next_turn_index(),
            stimulus_id: stimulus.stimulus_id.clone(),
            stimulus: stimulus.text.clone(),
            plans: history.iter().map(|r| r.plan.summary()).collect(),
            tool_results: history.iter().flat_map(|r| r.results().cloned()).collect(),
            outcome: outcome.clone(),
            iterations,
            started_at,
            completed_at: Utc::now(),
        };
        let turn_index = turn.index;
        for (key, value) in scratch_writes {
            self.store.set_scratch(&stimulus.session_id, &key, value).await?;
        }
        self.store.append_turn(&stimulus.session_id, turn).await?;

        let answered = matches!(outcome, TurnOutcome::Answered { .. });
        info!(
            session = %stimulus.session_id,
            turn = turn_index,
            iterations,
            answered,
            "Turn complete"
        );
        self.publish(DomainEvent::TurnCompleted {
            session_id: stimulus.session_id.clone(),
            stimulus_id: stimulus.stimulus_id.clone(),
            answered,
            iterations,
            timestamp: Utc::now(),
        });

        Ok(TurnReport {
            session_id: stimulus.session_id.clone(),
            stimulus_id: stimulus.stimulus_id.clone(),
            turn_index,
            outcome,
            iterations,
            trace,
            duplicate: false,
        })
    }

    /// ACT over one list of steps (a plan, or the selected arm of a branch).
    fn execute<'a>(
        &'a self,
        steps: &'a [PlanStep],
        table: &'a mut ResultTable,
    ) -> BoxFuture<'a, ()> {
        async move {
            let mut batch: Vec<&CallStep> = Vec::new();
            for step in steps {
                match step {
                    PlanStep::Call(call) => {
                        let deps = call.dependencies();
                        if batch.iter().any(|queued| deps.contains(&queued.id)) {
                            self.dispatch_batch(std::mem::take(&mut batch), table).await;
                        }
                        if let Some(dependency) = table.blocking_dependency(&deps) {
                            debug!(step = %call.id, dependency = %dependency, "Skipping step");
                            table.settle(&call.id, StepOutcome::SkippedDueToDependency { dependency });
                            continue;
                        }
                        batch.push(call);
                    }
                    PlanStep::Branch(branch) => {
                        self.dispatch_batch(std::mem::take(&mut batch), table).await;
                        let condition = &branch.condition;
                        let taken = match table.outcomes.get(&condition.step) {
                            Some(StepOutcome::Completed(result)) => {
                                if !result.is_ok() {
                                    table.handled.insert(condition.step.clone());
                                }
                                condition.holds(result)
                            }
                            _ => {
                                table.settle(
                                    &branch.id,
                                    StepOutcome::SkippedDueToDependency {
                                        dependency: condition.step.clone(),
                                    },
                                );
                                continue;
                            }
                        };
                        debug!(step = %branch.id, then = taken, "Branch evaluated");
                        table.settle(&branch.id, StepOutcome::BranchTaken { then: taken });
                        let arm = if taken { &branch.then } else { &branch.otherwise };
                        self.execute(arm, table).await;
                    }
                }
            }
            self.dispatch_batch(batch, table).await;
        }
        .boxed()
    }

    /// Resolve references and dispatch a batch concurrently.
    async fn dispatch_batch(&self, batch: Vec<&CallStep>, table: &mut ResultTable) {
        if batch.is_empty() {
            return;
        }
        debug!(
            steps = ?batch.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            "Dispatching batch"
        );

        let prepared: Vec<(String, Result<ToolCall, ToolResult>)> = batch
            .into_iter()
            .map(|step| {
                let prepared = match step.resolve_arguments(&table.outcomes) {
                    Ok(arguments) => Ok(ToolCall::new(&step.tool, arguments)),
                    Err(e) => {
                        let call = ToolCall::new(&step.tool, serde_json::json!({}));
                        Err(ToolResult::failed(
                            &call,
                            ToolErrorKind::InvalidArguments,
                            e.to_string(),
                            Duration::ZERO,
                        ))
                    }
                };
                (step.id.clone(), prepared)
            })
            .collect();

        let settled = join_all(prepared.into_iter().map(|(id, prepared)| async move {
            let result = match prepared {
                Ok(call) => self.dispatcher.dispatch(call, self.call_timeout).await,
                Err(result) => result,
            };
            (id, result)
        }))
        .await;

        for (id, result) in settled {
            table.settle(&id, StepOutcome::Completed(result));
        }
    }
}

/// One line per settled step across every iteration.
fn attempted_steps(history: &[IterationRecord]) -> Vec<String> {
    let mut lines = Vec::new();
    for record in history {
        if let Some(err) = &record.planner_error {
            lines.push(format!("iteration {}: planner: {err}", record.iteration));
        }
        for (id, outcome) in record.outcomes() {
            let line = match outcome {
                StepOutcome::Completed(result) => result.summary(),
                StepOutcome::SkippedDueToDependency { dependency } => {
                    format!("skipped_due_to_dependency on {dependency}")
                }
                StepOutcome::BranchTaken { then } => {
                    format!("branch took the {} arm", if *then { "then" } else { "else" })
                }
            };
            lines.push(format!("iteration {}: {id}: {line}", record.iteration));
        }
    }
    lines
}
