//! Shared test doubles for the strategy loop and worker tests.

use async_trait::async_trait;
use cortex_core::error::{PlannerError, ToolErrorKind};
use cortex_core::plan::Plan;
use cortex_core::planner::{Evaluation, IterationRecord, Planner, PlanningContext, default_evaluation};
use cortex_core::tool::{ToolCall, ToolDescriptor, ToolDispatcher, ToolResult};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A planner that returns scripted plans in order.
///
/// Once the script runs out every PLAN fails with a backend error.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Plan>>,
    plan_calls: AtomicU32,
    seen_problems: Mutex<Vec<Vec<String>>>,
    seen_scratch: Mutex<Vec<BTreeMap<String, Value>>>,
    last_record: Mutex<Option<IterationRecord>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            plan_calls: AtomicU32::new(0),
            seen_problems: Mutex::new(vec![]),
            seen_scratch: Mutex::new(vec![]),
            last_record: Mutex::new(None),
        }
    }

    pub fn plan_calls(&self) -> u32 {
        self.plan_calls.load(Ordering::SeqCst)
    }

    /// Problems of the previous iteration, as seen by each PLAN call.
    pub fn seen_problems(&self) -> Vec<Vec<String>> {
        self.seen_problems.lock().unwrap().clone()
    }

    /// Session scratch as each PLAN call saw it.
    pub fn seen_scratch(&self) -> Vec<BTreeMap<String, Value>> {
        self.seen_scratch.lock().unwrap().clone()
    }

    /// The most recent iteration handed to EVALUATE.
    pub fn last_record(&self) -> Option<IterationRecord> {
        self.last_record.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Plan, PlannerError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        let problems = ctx.history.last().map(|r| r.problems()).unwrap_or_default();
        self.seen_problems.lock().unwrap().push(problems);
        self.seen_scratch.lock().unwrap().push(ctx.session.scratch.clone());
        self.plans
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PlannerError::Backend("script exhausted".into()))
    }

    async fn evaluate(
        &self,
        _ctx: &PlanningContext<'_>,
        current: &IterationRecord,
    ) -> Result<Evaluation, PlannerError> {
        *self.last_record.lock().unwrap() = Some(current.clone());
        Ok(default_evaluation(current))
    }
}

/// A dispatcher with three built-in tools: `add`, `echo`, and `fail`.
pub struct StubDispatcher {
    delay: Mutex<Duration>,
    calls: Mutex<Vec<ToolCall>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubDispatcher {
    pub fn new() -> Self {
        Self {
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(vec![]),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn descriptor(name: &str, schema: serde_json::Value) -> ToolDescriptor {
    ToolDescriptor {
        name: name.into(),
        server_id: "stub".into(),
        input_schema: schema,
        description: format!("stub {name}"),
    }
}

#[async_trait]
impl ToolDispatcher for StubDispatcher {
    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![
            descriptor(
                "add",
                json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}, "required": ["a", "b"]}),
            ),
            descriptor("echo", json!({"type": "object", "properties": {"text": {"type": "string"}}})),
            descriptor("fail", json!({"type": "object"})),
        ]
    }

    async fn dispatch(&self, call: ToolCall, _timeout: Duration) -> ToolResult {
        let start = Instant::now();
        self.calls.lock().unwrap().push(call.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let args = &call.arguments;
        match call.tool_name.as_str() {
            "add" => {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                ToolResult::ok(&call, json!(a + b), start.elapsed())
            }
            "echo" => ToolResult::ok(&call, args["text"].clone(), start.elapsed()),
            "fail" => ToolResult::failed(&call, ToolErrorKind::ExecutionFailed, "backend said no", start.elapsed()),
            other => ToolResult::failed(
                &call,
                ToolErrorKind::UnknownTool,
                format!("no tool named '{other}'"),
                start.elapsed(),
            ),
        }
    }
}
