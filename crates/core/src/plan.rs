//! Plans — the tool-call graph a planner produces for one loop iteration.
//!
//! A plan is an ordered list of steps. A call step's arguments are bindings:
//! either a literal JSON value or a reference into the per-turn result table
//! (`{"$ref": "s1", "$path": "/sum"}`). References are resolved only when
//! the step is dispatched, so a step can consume the output of a step that
//! has not run yet when the plan is built.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::PlannerError;
use crate::tool::{ToolResult, render_payload};

/// The output of PLAN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,

    /// Direct answer, or an answer template over step outputs
    /// (`"The sum is {{s1}}"`, `"{{s2/items/0/title}}"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    /// Session scratch writes, resolved against the result table after ACT
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remember: BTreeMap<String, Binding>,
}

impl Plan {
    /// A plan that needs no tools.
    pub fn direct(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            ..Default::default()
        }
    }

    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn with_answer(mut self, template: impl Into<String>) -> Self {
        self.answer = Some(template.into());
        self
    }

    /// Store `binding` under `key` in the session scratch once ACT is done.
    pub fn remember(mut self, key: impl Into<String>, binding: Binding) -> Self {
        self.remember.insert(key.into(), binding);
        self
    }

    /// Reject plans the loop cannot execute faithfully: every step id,
    /// including those inside branch arms, must be unique.
    pub fn validate(&self) -> Result<(), PlannerError> {
        let mut seen = HashSet::new();
        check_unique_ids(&self.steps, &mut seen)
    }

    /// Whether this plan answers without touching any tool.
    pub fn is_direct(&self) -> bool {
        self.steps.is_empty() && self.answer.is_some()
    }

    /// One line per step, used as the persisted plan summary.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for step in &self.steps {
            step.summarize(0, &mut lines);
        }
        if self.steps.is_empty()
            && let Some(answer) = &self.answer
        {
            lines.push(format!("answer directly: {answer}"));
        }
        for key in self.remember.keys() {
            lines.push(format!("remember {key}"));
        }
        lines
    }
}

fn check_unique_ids<'a>(steps: &'a [PlanStep], seen: &mut HashSet<&'a str>) -> Result<(), PlannerError> {
    for step in steps {
        if !seen.insert(step.id()) {
            return Err(PlannerError::MalformedPlan(format!(
                "step id '{}' is used more than once",
                step.id()
            )));
        }
        if let PlanStep::Branch(branch) = step {
            check_unique_ids(&branch.then, seen)?;
            check_unique_ids(&branch.otherwise, seen)?;
        }
    }
    Ok(())
}

/// One scheduled invocation or a conditional branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanStep {
    Branch(BranchStep),
    Call(CallStep),
}

impl PlanStep {
    pub fn call(id: impl Into<String>, tool: impl Into<String>) -> CallStep {
        CallStep {
            id: id.into(),
            tool: tool.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Call(call) => &call.id,
            Self::Branch(branch) => &branch.id,
        }
    }

    /// Step ids this step needs before it can run.
    pub fn dependencies(&self) -> BTreeSet<String> {
        match self {
            Self::Call(call) => call.dependencies(),
            Self::Branch(branch) => BTreeSet::from([branch.condition.step.clone()]),
        }
    }

    fn summarize(&self, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        match self {
            Self::Call(call) => {
                let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                lines.push(format!("{indent}{}: {}({args})", call.id, call.tool));
            }
            Self::Branch(branch) => {
                lines.push(format!(
                    "{indent}{}: if {} {:?}",
                    branch.id, branch.condition.step, branch.condition.test
                ));
                for step in &branch.then {
                    step.summarize(depth + 1, lines);
                }
                if !branch.otherwise.is_empty() {
                    lines.push(format!("{indent}else"));
                    for step in &branch.otherwise {
                        step.summarize(depth + 1, lines);
                    }
                }
            }
        }
    }
}

/// A single tool invocation template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStep {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Binding>,
}

impl CallStep {
    /// Bind a literal argument.
    pub fn arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(name.into(), Binding::Value(value));
        self
    }

    /// Bind an argument to another step's output.
    pub fn arg_ref(
        mut self,
        name: impl Into<String>,
        step: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.arguments.insert(name.into(), Binding::reference(step, path));
        self
    }

    pub fn dependencies(&self) -> BTreeSet<String> {
        self.arguments
            .values()
            .filter_map(|binding| match binding {
                Binding::Ref(r) => Some(r.step.clone()),
                Binding::Value(_) => None,
            })
            .collect()
    }

    /// Resolve every binding against the result table.
    ///
    /// Callers must check dependencies first; a reference to a step that is
    /// missing or failed is reported as `Unresolved`.
    pub fn resolve_arguments(
        &self,
        table: &HashMap<String, StepOutcome>,
    ) -> Result<serde_json::Value, BindingError> {
        let mut resolved = serde_json::Map::new();
        for (name, binding) in &self.arguments {
            resolved.insert(name.clone(), binding.resolve(table)?);
        }
        Ok(serde_json::Value::Object(resolved))
    }
}

impl From<CallStep> for PlanStep {
    fn from(step: CallStep) -> Self {
        Self::Call(step)
    }
}

/// An argument binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    Ref(StepRef),
    Value(serde_json::Value),
}

impl Binding {
    pub fn resolve(&self, table: &HashMap<String, StepOutcome>) -> Result<serde_json::Value, BindingError> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Ref(r) => r.resolve(table),
        }
    }

    pub fn reference(step: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Ref(StepRef {
            step: step.into(),
            path: path.into(),
        })
    }
}

/// A late-bound reference to a prior step's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRef {
    #[serde(rename = "$ref")]
    pub step: String,

    /// JSON pointer into the payload; empty means the whole payload
    #[serde(rename = "$path", default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl StepRef {
    pub fn resolve(&self, table: &HashMap<String, StepOutcome>) -> Result<serde_json::Value, BindingError> {
        let payload = match table.get(&self.step) {
            Some(StepOutcome::Completed(result)) if result.is_ok() => result.payload.as_ref(),
            _ => return Err(BindingError::Unresolved(self.step.clone())),
        };
        let payload = payload.ok_or_else(|| BindingError::Unresolved(self.step.clone()))?;
        lookup(payload, &self.path)
            .cloned()
            .ok_or_else(|| BindingError::MissingPath {
                step: self.step.clone(),
                path: self.path.clone(),
            })
    }
}

/// Lookup that accepts JSON pointers, with or without the leading slash.
fn lookup<'a>(payload: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() || path == "/" {
        return Some(payload);
    }
    if path.starts_with('/') {
        payload.pointer(path)
    } else {
        payload.pointer(&format!("/{path}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("step '{0}' has no successful result")]
    Unresolved(String),

    #[error("step '{step}' output has nothing at '{path}'")]
    MissingPath { step: String, path: String },
}

/// A conditional fork on a prior step's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStep {
    pub id: String,
    #[serde(rename = "if")]
    pub condition: Condition,
    pub then: Vec<PlanStep>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub step: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub test: ConditionTest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTest {
    /// The step finished with status ok
    #[default]
    Succeeded,
    /// The step finished with status error
    Failed,
    /// The path exists in the payload
    Exists,
    /// The value at path is not null/false/0/""/[]/{}
    Truthy,
    Equals(serde_json::Value),
}

impl Condition {
    /// Evaluate against a completed step result.
    pub fn holds(&self, result: &ToolResult) -> bool {
        let value = result.payload.as_ref().and_then(|p| lookup(p, &self.path));
        match &self.test {
            ConditionTest::Succeeded => result.is_ok(),
            ConditionTest::Failed => !result.is_ok(),
            ConditionTest::Exists => value.is_some(),
            ConditionTest::Truthy => value.is_some_and(is_truthy),
            ConditionTest::Equals(expected) => value == Some(expected),
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// What happened to one plan step during ACT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The call was attempted; the result may be ok or error.
    Completed(ToolResult),
    /// A dependency failed or was skipped; the step never ran.
    SkippedDueToDependency { dependency: String },
    /// A branch condition was evaluated.
    BranchTaken { then: bool },
}

impl StepOutcome {
    /// Whether dependents of this step may run.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Completed(result) => result.is_ok(),
            Self::SkippedDueToDependency { .. } => false,
            Self::BranchTaken { .. } => true,
        }
    }
}

/// Render an answer template by substituting `{{step}}` / `{{step/path}}`.
///
/// Unknown or failed references are left verbatim.
pub fn render_answer(template: &str, table: &HashMap<String, StepOutcome>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = after[..end].trim();
        let (step, path) = match expr.split_once('/') {
            Some((step, path)) => (step, format!("/{path}")),
            None => (expr, String::new()),
        };
        let reference = StepRef {
            step: step.to_string(),
            path,
        };
        match reference.resolve(table) {
            Ok(value) => out.push_str(&render_payload(&value)),
            Err(_) => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
