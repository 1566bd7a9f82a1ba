//! Deterministic planner driven by slash commands.
//!
//! ```text
//! /tools                    list the registry
//! /add {"a": 2, "b": 3}     call a tool with JSON arguments
//! /add a=2 b=3              same, values parsed as JSON where possible
//! anything else             usage help
//! ```
//!
//! Useful offline and in tests: no model, no network, the same input always
//! yields the same plan.

use async_trait::async_trait;
use cortex_core::error::{PlannerError, ToolErrorKind};
use cortex_core::plan::{Plan, PlanStep};
use cortex_core::planner::{Intent, IterationRecord, Planner, PlanningContext};
use cortex_core::session::SessionState;
use cortex_core::stimulus::Stimulus;
use cortex_core::tool::ToolDescriptor;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Help,
    ListTools,
    Call { tool: String, args: Map<String, Value> },
}

pub struct CommandPlanner {
    history: usize,
}

impl CommandPlanner {
    pub fn new() -> Self {
        Self { history: 3 }
    }

    pub fn with_history(mut self, turns: usize) -> Self {
        self.history = turns;
        self
    }
}

impl Default for CommandPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse(goal: &str) -> Result<Command, PlannerError> {
    let Some(rest) = goal.trim().strip_prefix('/') else {
        return Ok(Command::Help);
    };
    let (name, tail) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    match name {
        "" | "help" => Ok(Command::Help),
        "tools" => Ok(Command::ListTools),
        tool => Ok(Command::Call {
            tool: tool.to_string(),
            args: parse_args(tail.trim())?,
        }),
    }
}

fn parse_args(tail: &str) -> Result<Map<String, Value>, PlannerError> {
    if tail.is_empty() {
        return Ok(Map::new());
    }
    if tail.starts_with('{') {
        return match serde_json::from_str(tail) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(PlannerError::MalformedPlan(format!(
                "arguments must be a JSON object, got {other}"
            ))),
            Err(e) => Err(PlannerError::MalformedPlan(format!("invalid JSON arguments: {e}"))),
        };
    }
    let mut args = Map::new();
    for token in tail.split_whitespace() {
        let Some((key, raw)) = token.split_once('=') else {
            return Err(PlannerError::MalformedPlan(format!(
                "expected key=value, got '{token}'"
            )));
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

/// Only connection-level failures are worth sending the same call again.
fn worth_retrying(record: &IterationRecord) -> bool {
    record.planner_error.is_none()
        && record.results().any(|r| !r.is_ok())
        && record.results().filter(|r| !r.is_ok()).all(|r| {
            matches!(
                r.error_kind(),
                Some(
                    ToolErrorKind::Timeout
                        | ToolErrorKind::ConnectionUnavailable
                        | ToolErrorKind::TransportFailure
                )
            )
        })
}

fn tool_list(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "No tools are available.".into();
    }
    let mut sorted: Vec<_> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut text = format!("{} tool(s) available:", sorted.len());
    for tool in sorted {
        text.push_str(&format!("\n- {} [{}]", tool.name, tool.server_id));
        if !tool.description.is_empty() {
            text.push_str(&format!(": {}", tool.description));
        }
    }
    text
}

fn usage(tools: &[ToolDescriptor]) -> String {
    format!(
        "Commands:\n  /tools                  list available tools\n  /<tool> {{json}}          call a tool with JSON arguments\n  /<tool> key=value ...   call a tool with simple arguments\n{} tool(s) available.",
        tools.len()
    )
}

#[async_trait]
impl Planner for CommandPlanner {
    fn name(&self) -> &str {
        "command"
    }

    async fn perceive(&self, stimulus: &Stimulus, session: &SessionState) -> Result<Intent, PlannerError> {
        let mut intent = Intent::from_stimulus(stimulus, session, self.history);
        if let Ok(Command::Call { tool, .. }) = parse(&intent.goal) {
            intent.tool_hints.push(tool);
        }
        Ok(intent)
    }

    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Plan, PlannerError> {
        match parse(&ctx.intent.goal)? {
            Command::Help => Ok(Plan::direct(usage(ctx.tools))),
            Command::ListTools => Ok(Plan::direct(tool_list(ctx.tools))),
            Command::Call { tool, args } => {
                if let Some(previous) = ctx.history.last()
                    && !worth_retrying(previous)
                {
                    return Err(PlannerError::Backend(format!(
                        "no alternative plan for /{tool}: {}",
                        previous.problems().join("; ")
                    )));
                }
                let step = args
                    .into_iter()
                    .fold(PlanStep::call("s1", tool), |step, (key, value)| step.arg(key, value));
                Ok(Plan::new(vec![step.into()]))
            }
        }
    }
}
