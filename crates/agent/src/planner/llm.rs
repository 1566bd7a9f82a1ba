//! Planner backed by an OpenAI-compatible chat-completions endpoint.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, and anything else exposing
//! `/chat/completions`. The model is asked for a JSON plan in the shape of
//! [`Plan`]; fenced or bare JSON in the reply is accepted.
//!
//! EVALUATE only calls the model when a clean iteration produced payloads
//! but no answer template; otherwise the default evaluation applies.

use async_trait::async_trait;
use cortex_config::PlannerConfig;
use cortex_core::error::PlannerError;
use cortex_core::plan::Plan;
use cortex_core::planner::{
    Evaluation, Intent, IterationRecord, Planner, PlanningContext, default_evaluation,
};
use cortex_core::session::SessionState;
use cortex_core::stimulus::Stimulus;
use cortex_core::tool::render_payload;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const PLAN_SYSTEM_PROMPT: &str = r#"You are the planner of a tool-using agent. Reply with a single JSON object and nothing else:

{"steps": [ ... ], "answer": "..."}

Each step is either a call:
  {"id": "s1", "tool": "<tool name>", "arguments": {"<param>": <value or reference>}}
or a branch:
  {"id": "b1", "if": {"step": "s1", "path": "/field", "test": "succeeded" | "failed" | "exists" | "truthy" | {"equals": <value>}}, "then": [steps], "else": [steps]}

A reference feeds one step's output into another: {"$ref": "s1", "$path": "/field"} ("$path" may be omitted for the whole output).
"answer" is optional. It may be plain text, or a template where {{s1}} or {{s1/field}} is replaced with step output.
"remember" is optional: {"<key>": <value or reference>} stores values for later requests in this conversation.
If no tool is needed, reply with {"steps": [], "answer": "<your answer>"}.
Only use tools from the list you are given. If an earlier attempt failed, plan differently."#;

const ANSWER_SYSTEM_PROMPT: &str = "You write the final reply of a tool-using agent. Using only the tool results provided, answer the user's request directly and concisely. Reply with the answer text only.";

pub struct LlmPlanner {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    history: usize,
    client: reqwest::Client,
}

impl LlmPlanner {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
            max_tokens: 1024,
            history: 3,
            client,
        }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        let mut planner = Self::new(
            &config.base_url,
            config.api_key.clone().unwrap_or_default(),
            &config.model,
        );
        planner.temperature = config.temperature;
        planner.max_tokens = config.max_tokens;
        planner
    }

    pub fn with_history(mut self, turns: usize) -> Self {
        self.history = turns;
        self
    }

    /// One non-streaming chat completion; returns the reply text.
    async fn complete(&self, system: &str, user: String) -> Result<String, PlannerError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        debug!(model = %self.model, "Sending planner request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlannerError::Backend(format!("request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PlannerError::NotConfigured(
                "invalid API key or insufficient permissions".into(),
            ));
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "Planner endpoint returned error");
            return Err(PlannerError::Backend(format!("HTTP {status}: {error_body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| PlannerError::Backend(format!("failed to parse response: {e}")))?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| PlannerError::Backend("empty completion".into()))
    }
}

/// The JSON object inside a reply: a ```json fence if present, else the
/// outermost braces.
fn extract_json(reply: &str) -> Option<&str> {
    if let Some(start) = reply.find("```") {
        let after = &reply[start + 3..];
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let fenced = body[..end].trim();
            if fenced.starts_with('{') {
                return Some(fenced);
            }
        }
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

fn parse_plan(reply: &str) -> Result<Plan, PlannerError> {
    let json = extract_json(reply)
        .ok_or_else(|| PlannerError::MalformedPlan("no JSON object in reply".into()))?;
    serde_json::from_str(json).map_err(|e| PlannerError::MalformedPlan(e.to_string()))
}

fn plan_prompt(ctx: &PlanningContext<'_>) -> String {
    let mut prompt = format!("Request: {}\n", ctx.intent.goal);

    if !ctx.intent.context.is_empty() {
        prompt.push_str("\nEarlier in this conversation:\n");
        for line in &ctx.intent.context {
            prompt.push_str(&format!("- {line}\n"));
        }
    }

    if !ctx.session.scratch.is_empty() {
        prompt.push_str("\nRemembered values:\n");
        for (key, value) in &ctx.session.scratch {
            prompt.push_str(&format!("- {key}: {}\n", render_payload(value)));
        }
    }

    prompt.push_str("\nAvailable tools:\n");
    if ctx.tools.is_empty() {
        prompt.push_str("(none)\n");
    }
    for tool in ctx.tools {
        prompt.push_str(&format!(
            "- {}: {}\n  input schema: {}\n",
            tool.name, tool.description, tool.input_schema
        ));
    }

    for record in ctx.history {
        prompt.push_str(&format!("\nAttempt {}:\n", record.iteration));
        for line in record.plan.summary() {
            prompt.push_str(&format!("  {line}\n"));
        }
        let problems = record.problems();
        if problems.is_empty() {
            prompt.push_str("  no failures, but the result did not answer the request\n");
        }
        for problem in problems {
            prompt.push_str(&format!("  failed: {problem}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nThis is attempt {} of {}. Reply with the JSON plan.",
        ctx.iteration, ctx.max_iterations
    ));
    prompt
}

fn answer_prompt(ctx: &PlanningContext<'_>, current: &IterationRecord) -> String {
    let mut prompt = format!("Request: {}\n\nTool results:\n", ctx.intent.goal);
    for result in current.results() {
        let payload = result.payload.as_ref().map(render_payload).unwrap_or_default();
        prompt.push_str(&format!("- {}: {payload}\n", result.tool_name));
    }
    prompt
}

#[async_trait]
impl Planner for LlmPlanner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn perceive(&self, stimulus: &Stimulus, session: &SessionState) -> Result<Intent, PlannerError> {
        Ok(Intent::from_stimulus(stimulus, session, self.history))
    }

    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Plan, PlannerError> {
        let reply = self.complete(PLAN_SYSTEM_PROMPT, plan_prompt(ctx)).await?;
        let plan = parse_plan(&reply)?;
        debug!(steps = plan.steps.len(), direct = plan.is_direct(), "Model produced plan");
        Ok(plan)
    }

    async fn evaluate(
        &self,
        ctx: &PlanningContext<'_>,
        current: &IterationRecord,
    ) -> Result<Evaluation, PlannerError> {
        let needs_model = current.is_clean()
            && current.plan.answer.is_none()
            && current.results().next().is_some();
        if !needs_model {
            return Ok(default_evaluation(current));
        }
        match self.complete(ANSWER_SYSTEM_PROMPT, answer_prompt(ctx, current)).await {
            Ok(text) => Ok(Evaluation::Finalize(text.trim().to_string())),
            Err(e) => {
                warn!(error = %e, "Answer composition failed, using raw results");
                Ok(default_evaluation(current))
            }
        }
    }
}

// --- OpenAI API types (subset) ---

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use cortex_core::plan::{PlanStep, StepOutcome};
    use cortex_core::tool::{ToolCall, ToolDescriptor, ToolResult};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    async fn start_server() -> String {
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|headers: HeaderMap, axum::Json(body): axum::Json<Value>| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
                        return (StatusCode::UNAUTHORIZED, axum::Json(json!({"error": "bad key"})));
                    }
                    let system = body["messages"][0]["content"].as_str().unwrap_or_default();
                    let content = if system.starts_with("You are the planner") {
                        "Here you go:\n```json\n{\"steps\": [{\"id\": \"s1\", \"tool\": \"add\", \"arguments\": {\"a\": 2, \"b\": 3}}]}\n```"
                    } else {
                        "  The sum is 5.  "
                    };
                    (
                        StatusCode::OK,
                        axum::Json(json!({
                            "choices": [{"message": {"role": "assistant", "content": content}}]
                        })),
                    )
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn tools() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "add".into(),
            server_id: "math".into(),
            input_schema: json!({"type": "object", "required": ["a", "b"]}),
            description: "Add two numbers".into(),
        }]
    }

    #[test]
    fn extracts_fenced_and_bare_json() {
        assert_eq!(
            extract_json("sure\n```json\n{\"steps\": []}\n```\nbye"),
            Some("{\"steps\": []}")
        );
        assert_eq!(
            extract_json("plan: {\"answer\": \"hi\"} done"),
            Some("{\"answer\": \"hi\"}")
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn parses_plans_with_references_and_branches() {
        let plan = parse_plan(
            r#"{"steps": [
                {"id": "s1", "tool": "search", "arguments": {"q": "rust"}},
                {"id": "b1", "if": {"step": "s1", "path": "/hits", "test": "truthy"},
                 "then": [{"id": "s2", "tool": "fetch", "arguments": {"url": {"$ref": "s1", "$path": "/hits/0/url"}}}],
                 "else": []}
            ], "answer": "{{s2}}"}"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.steps[1], PlanStep::Branch(_)));
        assert!(matches!(parse_plan("```\nnot json\n```"), Err(PlannerError::MalformedPlan(_))));
    }

    #[test]
    fn prompt_lists_tools_and_failed_attempts() {
        let stimulus = Stimulus::new("s", "compute 2+3");
        let mut session = SessionState::new("s");
        session.scratch.insert("doc_id".into(), json!("d-7"));
        let intent = Intent::from_stimulus(&stimulus, &session, 3);
        let tools = tools();
        let call = ToolCall::new("unknown_fn", json!({}));
        let failed = ToolResult::failed(
            &call,
            cortex_core::ToolErrorKind::UnknownTool,
            "no such tool",
            Duration::ZERO,
        );
        let history = [IterationRecord {
            iteration: 1,
            plan: Plan::new(vec![PlanStep::call("s1", "unknown_fn").into()]),
            order: vec!["s1".into()],
            table: [("s1".to_string(), StepOutcome::Completed(failed))].into(),
            ..Default::default()
        }];
        let ctx = PlanningContext {
            stimulus: &stimulus,
            session: &session,
            intent: &intent,
            tools: &tools,
            history: &history,
            iteration: 2,
            max_iterations: 3,
        };
        let prompt = plan_prompt(&ctx);
        assert!(prompt.contains("Request: compute 2+3"));
        assert!(prompt.contains("- add: Add two numbers"));
        assert!(prompt.contains("Remembered values:\n- doc_id: d-7"));
        assert!(prompt.contains("Attempt 1:"));
        assert!(prompt.contains("unknown_tool"));
        assert!(prompt.contains("attempt 2 of 3"));
    }

    #[tokio::test]
    async fn plans_and_composes_answer_through_the_endpoint() {
        let base_url = start_server().await;
        let planner = LlmPlanner::new(&base_url, "sk-test", "test-model");
        let stimulus = Stimulus::new("s", "compute 2+3");
        let session = SessionState::new("s");
        let intent = planner.perceive(&stimulus, &session).await.unwrap();
        let tools = tools();
        let ctx = PlanningContext {
            stimulus: &stimulus,
            session: &session,
            intent: &intent,
            tools: &tools,
            history: &[],
            iteration: 1,
            max_iterations: 3,
        };

        let plan = planner.plan(&ctx).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].id(), "s1");

        let call = ToolCall::new("add", json!({"a": 2, "b": 3}));
        let record = IterationRecord {
            iteration: 1,
            plan,
            order: vec!["s1".into()],
            table: [(
                "s1".to_string(),
                StepOutcome::Completed(ToolResult::ok(&call, json!(5), Duration::ZERO)),
            )]
            .into(),
            ..Default::default()
        };
        assert_eq!(
            planner.evaluate(&ctx, &record).await.unwrap(),
            Evaluation::Finalize("The sum is 5.".into())
        );
    }

    #[tokio::test]
    async fn rejected_key_is_a_configuration_error() {
        let base_url = start_server().await;
        let planner = LlmPlanner::new(&base_url, "wrong", "test-model");
        let err = planner.complete("system", "hi".into()).await.unwrap_err();
        assert!(matches!(err, PlannerError::NotConfigured(_)));
    }
}
