//! LightAgent — a minimal, isolated agent for background work.
//!
//! Unlike the full graph, a LightAgent has no session, no history, and no
//! context layers: just a caller-supplied system prompt, a restricted tool
//! subset, and an optional model override. It never touches the main
//! session's messages; the only way its output reaches a user is through
//! a side-effectful tool such as `send_message_to_user`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use graphbot_core::error::Error;
use graphbot_core::message::Message;
use graphbot_core::provider::{ChatRequest, Provider};
use graphbot_core::tool::Tool;

const DEFAULT_ITERATIONS: u32 = 5;

/// The outcome of a LightAgent run.
#[derive(Debug, Clone)]
pub struct LightRun {
    /// Final assistant text (may carry a SKIP marker for monitor jobs)
    pub text: String,

    /// Provider-reported tokens consumed
    pub tokens_used: u32,

    /// Names of tools the agent actually called
    pub tools_called: HashSet<String>,
}

/// An isolated single-shot agent.
pub struct LightAgent {
    provider: Arc<dyn Provider>,
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    model: String,
    temperature: f32,
    max_iterations: u32,
}

impl LightAgent {
    pub fn new(
        provider: Arc<dyn Provider>,
        system_prompt: impl Into<String>,
        tools: Vec<Arc<dyn Tool>>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            tools,
            model: model.into(),
            temperature: 0.7,
            max_iterations: DEFAULT_ITERATIONS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Run one task to completion: loop reason → execute_tools until the
    /// first assistant message without tool calls, or the iteration bound.
    pub async fn run(&self, user_message: &str) -> Result<LightRun, Error> {
        let mut messages = vec![
            Message::system(&self.system_prompt),
            Message::user(user_message),
        ];
        let mut tokens_used = 0u32;
        let mut tools_called = HashSet::new();
        let tool_defs: Vec<_> = self.tools.iter().map(|t| t.to_definition()).collect();

        for iteration in 0..=self.max_iterations {
            // Nearing the bound: last call goes out without tools and with
            // an explicit nudge to wrap up.
            let at_bound = iteration >= self.max_iterations;
            let mut request =
                ChatRequest::new(&self.model, messages.clone()).with_temperature(self.temperature);
            if at_bound {
                request.messages.push(Message::user(
                    "Summarize your findings now. Do not make any more tool calls.",
                ));
            } else {
                request = request.with_tools(tool_defs.clone());
            }

            let response = self.provider.chat(request).await?;
            tokens_used += response.usage.total_tokens;
            let message = response.message;

            if message.tool_calls.is_empty() || at_bound {
                debug!(
                    chars = message.content.len(),
                    tokens = tokens_used,
                    "LightAgent done"
                );
                return Ok(LightRun {
                    text: message.content,
                    tokens_used,
                    tools_called,
                });
            }

            let calls = message.tool_calls.clone();
            messages.push(message);
            for call in calls {
                tools_called.insert(call.name.clone());
                let result = match self.find_tool(&call.name) {
                    None => format!("Tool '{}' not found", call.name),
                    Some(tool) => {
                        let timeout = Duration::from_secs(tool.timeout_secs());
                        match tokio::time::timeout(timeout, tool.execute(call.arguments.clone()))
                            .await
                        {
                            Ok(Ok(output)) => output,
                            Ok(Err(e)) => {
                                warn!(tool = %call.name, error = %e, "LightAgent tool failed");
                                format!("Tool error: {e}")
                            }
                            Err(_) => format!("Tool error: '{}' timed out", call.name),
                        }
                    }
                };
                messages.push(Message::tool_result(&call.id, result));
            }
        }

        // Unreachable: the at_bound arm above always returns
        Ok(LightRun {
            text: String::new(),
            tokens_used,
            tools_called,
        })
    }

    fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }
}
