//! DelegationPlanner — one structured-output LLM call that turns a
//! natural-language task into a typed [`ExecutionPlan`].
//!
//! The planner makes two orthogonal decisions: **when** to run (execution)
//! and **how** to run (processor). Its raw output is a flat, nullable JSON
//! object constrained by a schema; validation into the typed plan is
//! strict — a schema-invalid or rule-violating response is a fatal
//! `PlanError`, never silently replaced by a fallback.

use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use graphbot_core::error::{Error, PlanError};
use graphbot_core::message::Message;
use graphbot_core::plan::{Execution, ExecutionPlan, NotifyCondition, ProcessorSpec};
use graphbot_core::provider::Provider;
use graphbot_core::tool::ToolRegistry;

const PLANNER_PROMPT: &str = r#"You are a task delegation planner. Given a task description and available tools,
decide the optimal execution strategy and configuration for a background agent.

## Available Tools
{tool_catalog}

## Two Orthogonal Decisions

### 1. Execution Type (WHEN to run)
- "immediate": Run now in background (research, computation, complex tasks)
- "delayed": Run once after a delay (send message later, check something later)
- "recurring": Run on a schedule (periodic checks, regular reports)
- "monitor": Run on a schedule, only notify when a condition is met (price alerts)

### 2. Processor Type (HOW to run)
- "static": Send a plain text message to the user. No agent, no tool call. Use for simple reminders.
- "function": Call a specific tool with known arguments. No LLM needed. Use when the exact
  tool and arguments are clear (e.g. send a message to someone, add a favorite).
  The action itself is the goal — no result is sent back to the requesting user.
- "agent": Run a lightweight agent (LLM + selected tools) for single-step or simple
  multi-step tasks. The agent has ONLY the tools you list — it cannot delegate, create
  reminders, or access user memory. Good for: fetch data, search, summarize, send a message.

## Rules
- For "static": set message; leave tools empty, tool_name/tool_args/prompt null.
- For "function": set tool_name and tool_args with the exact tool call. No prompt needed.
- For "agent": set the tools list and a focused prompt (2-3 sentences) with full task details.
  ALWAYS include send_message_to_user in the tools list. The agent is responsible for
  delivering its own results. The prompt MUST instruct the agent to send results via
  send_message_to_user to the appropriate target user.
- If the task is simple, suggest a cheaper model. If complex, leave model null.
- For "delayed": estimate delay_seconds from the task description.
- For "recurring" and "monitor": produce a 5-field cron expression.
- For "monitor": the prompt MUST instruct the agent to respond with [SKIP] when there is
  nothing to report.
- Return ONLY valid JSON, no markdown.

## Examples
- "Remind me about the meeting in 2 hours"
  -> execution: "delayed", processor: "static", delay_seconds: 7200,
     message: "Reminder: you have a meeting!"

- "Send a message to Murat saying hello in 5 minutes"
  -> execution: "delayed", processor: "function", delay_seconds: 300,
     tool_name: "send_message_to_user",
     tool_args: {"target_user": "Murat", "message": "hello"}

- "Check the weather and report back in 2 minutes"
  -> execution: "delayed", processor: "agent", delay_seconds: 120,
     tools: ["web_fetch", "send_message_to_user"],
     prompt: "Use web_fetch('weather:istanbul') to get current weather data, then send a
     detailed summary including temperature, humidity and wind."

- "Alert me when gold exceeds 3000"
  -> execution: "monitor", processor: "agent", cron_expr: "*/30 * * * *",
     tools: ["web_fetch", "send_message_to_user"],
     prompt: "Check the gold price. If above 3000 send the current price to the user.
     Otherwise respond [SKIP]."

- "Send hello to Zeynep every 10 minutes"
  -> execution: "recurring", processor: "function", cron_expr: "*/10 * * * *",
     tool_name: "send_message_to_user",
     tool_args: {"target_user": "Zeynep", "message": "hello"}

- "Research this topic for me"
  -> execution: "immediate", processor: "agent",
     tools: ["web_search", "web_fetch", "send_message_to_user"],
     prompt: "Research the given topic thoroughly and send a clear summary to the user."
{extra_examples}
## Output Format (JSON)
{
  "execution": "immediate|delayed|recurring|monitor",
  "processor": "static|function|agent",
  "delay_seconds": null,
  "cron_expr": null,
  "notify_condition": "always|notify_skip",
  "channel": null,
  "message": null,
  "tool_name": null,
  "tool_args": null,
  "tools": [],
  "prompt": null,
  "model": null
}"#;

/// The planner's raw (flat, nullable) output shape.
#[derive(Debug, Deserialize)]
struct RawPlan {
    execution: Execution,
    processor: String,
    #[serde(default)]
    delay_seconds: Option<u64>,
    #[serde(default)]
    cron_expr: Option<String>,
    #[serde(default)]
    notify_condition: Option<NotifyCondition>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_args: Option<serde_json::Value>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// JSON schema for the planner's structured-output call.
fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "execution": {
                "type": "string",
                "enum": ["immediate", "delayed", "recurring", "monitor"],
            },
            "processor": {
                "type": "string",
                "enum": ["static", "function", "agent"],
            },
            "delay_seconds": {"type": ["integer", "null"]},
            "cron_expr": {"type": ["string", "null"]},
            "notify_condition": {
                "type": ["string", "null"],
                "enum": ["always", "notify_skip", null],
            },
            "channel": {"type": ["string", "null"]},
            "message": {"type": ["string", "null"]},
            "tool_name": {"type": ["string", "null"]},
            "tool_args": {},
            "tools": {"type": "array", "items": {"type": "string"}},
            "prompt": {"type": ["string", "null"]},
            "model": {"type": ["string", "null"]},
        },
        "required": ["execution", "processor"],
        "additionalProperties": false,
    })
}

/// Plans delegation with a single LLM call.
pub struct DelegationPlanner {
    provider: Arc<dyn Provider>,
    model: String,
    tool_catalog: String,
    background_tools: Vec<String>,
    extra_examples: String,
}

impl DelegationPlanner {
    /// `registry` must be the background subregistry: the planner only
    /// references tools an isolated agent may actually receive.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        registry: &ToolRegistry,
        extra_examples: &[String],
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            tool_catalog: registry.catalog(),
            background_tools: registry.names(),
            extra_examples: Self::format_examples(extra_examples),
        }
    }

    fn format_examples(examples: &[String]) -> String {
        if examples.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n## Additional Examples (from config)\n");
        for example in examples {
            out.push_str(&format!("- {example}\n"));
        }
        out
    }

    fn system_prompt(&self) -> String {
        PLANNER_PROMPT
            .replace("{tool_catalog}", &self.tool_catalog)
            .replace("{extra_examples}", &self.extra_examples)
    }

    /// Plan a task. Invalid planner output is fatal to the delegation.
    pub async fn plan(&self, task: &str) -> Result<ExecutionPlan, Error> {
        let messages = vec![
            Message::system(self.system_prompt()),
            Message::user(format!("Task: {task}")),
        ];
        debug!(model = %self.model, task_chars = task.len(), "Planner LLM call");

        let raw_value = self
            .provider
            .chat_structured(messages, response_schema(), &self.model)
            .await?;

        let raw: RawPlan = serde_json::from_value(raw_value)
            .map_err(|e| PlanError::InvalidJson(e.to_string()))?;
        let plan = self.into_plan(raw)?;
        debug!(?plan.execution, processor = plan.processor.kind(), "Plan produced");
        Ok(plan)
    }

    /// Validate the raw output into the typed plan.
    fn into_plan(&self, raw: RawPlan) -> Result<ExecutionPlan, PlanError> {
        let processor = match raw.processor.as_str() {
            "static" => ProcessorSpec::Static {
                message: raw
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| PlanError::Invalid("static plan requires message".into()))?,
            },
            "function" => {
                let tool_name = raw
                    .tool_name
                    .filter(|n| !n.trim().is_empty())
                    .ok_or_else(|| PlanError::Invalid("function plan requires tool_name".into()))?;
                if !self.background_tools.contains(&tool_name) {
                    return Err(PlanError::UnknownTool(tool_name));
                }
                ProcessorSpec::Function {
                    tool_name,
                    tool_args: raw.tool_args.unwrap_or(serde_json::json!({})),
                }
            }
            "agent" => {
                for name in &raw.tools {
                    if !self.background_tools.contains(name) {
                        return Err(PlanError::UnknownTool(name.clone()));
                    }
                }
                ProcessorSpec::Agent {
                    prompt: raw
                        .prompt
                        .filter(|p| !p.trim().is_empty())
                        .ok_or_else(|| PlanError::Invalid("agent plan requires prompt".into()))?,
                    tools: raw.tools,
                    model: raw.model.filter(|m| m.contains('/') && m.len() > 5),
                }
            }
            other => return Err(PlanError::Invalid(format!("unknown processor '{other}'"))),
        };

        let plan = ExecutionPlan {
            execution: raw.execution,
            delay_seconds: raw.delay_seconds,
            cron_expr: raw.cron_expr,
            notify_condition: raw.notify_condition.unwrap_or_default(),
            channel: raw.channel,
            processor,
        }
        .normalize();
        plan.validate()?;
        Ok(plan)
    }
}
