//! Processor dispatch — the shared execution semantics for scheduled and
//! immediate background work.
//!
//! Three processors:
//! - **static**: the plan's literal message is delivered, nothing else.
//! - **function**: one tool call is the entire side effect; no delivery.
//! - **agent**: an isolated LightAgent runs and owns its own delivery
//!   (via a messaging tool). The scheduler never re-delivers an agent's
//!   response — that rule is the sole protection against duplicates.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use graphbot_agent::LightAgent;
use graphbot_core::channel::ChannelPort;
use graphbot_core::error::{Error, ToolError};
use graphbot_core::event::EventBus;
use graphbot_core::plan::{ExecutionPlan, ProcessorSpec};
use graphbot_core::provider::Provider;
use graphbot_core::tool::ToolRegistry;
use graphbot_store::Store;

/// Channels whose "delivery" is the event queue itself.
const QUEUE_CHANNELS: [&str; 2] = ["api", "ws"];

/// Responses that suppress notify_skip delivery, matched case-insensitively
/// at the response boundary.
const SKIP_MARKERS: [&str; 3] = ["SKIP", "[SKIP]", "[NO_NOTIFY]"];

/// What a processor run produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Textual result, when the processor has one
    pub response: Option<String>,

    /// Whether the caller should deliver `response` to the user. Function
    /// and agent processors own their side effects, so this is false.
    pub deliver: bool,
}

/// How a delivery landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed through the channel port
    Direct,
    /// Saved to the event queue for the next session turn
    Queued,
}

/// Executes plans. Shared by the scheduler and the subagent worker.
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    /// Background subregistry — never contains filesystem / shell /
    /// scheduling / delegation tools.
    registry: Arc<ToolRegistry>,
    port: Arc<dyn ChannelPort>,
    store: Store,
    bus: Arc<EventBus>,
    default_model: String,
    agent_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        port: Arc<dyn ChannelPort>,
        store: Store,
        bus: Arc<EventBus>,
        default_model: impl Into<String>,
        agent_timeout_secs: u64,
    ) -> Self {
        Self {
            provider,
            registry,
            port,
            store,
            bus,
            default_model: default_model.into(),
            agent_timeout: Duration::from_secs(agent_timeout_secs),
        }
    }

    pub fn port(&self) -> &Arc<dyn ChannelPort> {
        &self.port
    }

    /// Execute a plan's processor. `message` is the original task text —
    /// the user message handed to an agent processor.
    pub async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        message: &str,
        channel: &str,
    ) -> Result<DispatchOutcome, Error> {
        match &plan.processor {
            ProcessorSpec::Static { message: text } => Ok(DispatchOutcome {
                response: Some(text.clone()),
                deliver: true,
            }),

            ProcessorSpec::Function { tool_name, tool_args } => {
                let tool = self.registry.get_available(tool_name).map_err(|e| {
                    warn!(tool = %tool_name, "Function processor tool unavailable");
                    Error::Tool(e)
                })?;
                let mut args = tool_args.clone();
                inject_channel_arg(&mut args, channel);
                debug!(tool = %tool_name, "Function processor invoking tool");
                let timeout = Duration::from_secs(tool.timeout_secs());
                let output = tokio::time::timeout(timeout, tool.execute(args))
                    .await
                    .map_err(|_| {
                        Error::Tool(ToolError::Timeout {
                            tool_name: tool_name.clone(),
                            timeout_secs: tool.timeout_secs(),
                        })
                    })??;
                debug!(tool = %tool_name, output_chars = output.len(), "Function processor done");
                // The tool call is the entire side effect
                Ok(DispatchOutcome {
                    response: None,
                    deliver: false,
                })
            }

            ProcessorSpec::Agent { prompt, tools, model } => {
                let mut prompt = prompt.clone();
                if channel != "api" {
                    // The agent must address the originating transport
                    prompt.push_str(&format!(
                        "\n\nIMPORTANT: When calling send_message_to_user, you MUST set channel='{channel}'."
                    ));
                }
                let agent = LightAgent::new(
                    self.provider.clone(),
                    prompt,
                    self.registry.resolve(tools),
                    model.as_deref().unwrap_or(&self.default_model),
                );
                let run = tokio::time::timeout(self.agent_timeout, agent.run(message))
                    .await
                    .map_err(|_| Error::Internal("agent processor timed out".into()))??;
                debug!(
                    tokens = run.tokens_used,
                    tools = ?run.tools_called,
                    "Agent processor done"
                );
                // The agent owns delivery; the caller only inspects the
                // text for SKIP markers
                Ok(DispatchOutcome {
                    response: Some(run.text),
                    deliver: false,
                })
            }
        }
    }

    /// Deliver text to a user. Falls back to the event queue on queue
    /// channels; transport failures on real channels propagate.
    pub async fn deliver(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
        event_kind: &str,
    ) -> Result<Delivery, Error> {
        match self.port.send(user_id, channel, text).await {
            Ok(()) => {
                info!(%user_id, %channel, "Delivered directly");
                Ok(Delivery::Direct)
            }
            Err(e) if QUEUE_CHANNELS.contains(&channel) => {
                debug!(%user_id, error = %e, "No live session, queueing event");
                let event = self
                    .store
                    .enqueue_event(user_id, event_kind, &serde_json::Value::String(text.into()))
                    .await?;
                self.bus.publish(event);
                Ok(Delivery::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Should a notify_skip response be suppressed? Empty responses and
    /// SKIP markers at either end of the text count.
    pub fn should_skip(response: &str) -> bool {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return true;
        }
        let upper = trimmed.to_uppercase();
        SKIP_MARKERS
            .iter()
            .any(|m| upper.starts_with(m) || upper.ends_with(m))
    }
}

fn inject_channel_arg(args: &mut serde_json::Value, channel: &str) {
    if let Some(object) = args.as_object_mut() {
        if !object.contains_key("channel") {
            object.insert("channel".into(), serde_json::Value::String(channel.into()));
        }
    } else if args.is_null() {
        *args = serde_json::json!({ "channel": channel });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graphbot_core::channel::test_support::RecordingPort;
    use graphbot_core::error::ProviderError;
    use graphbot_core::message::{Message, ToolCall};
    use graphbot_core::plan::{Execution, NotifyCondition};
    use graphbot_core::provider::{ChatRequest, ChatResponse, ExtractedFacts, Usage};
    use graphbot_core::tool::Tool;
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let mut script = self.script.lock().unwrap();
            let message = if script.is_empty() {
                Message::assistant("done")
            } else {
                script.remove(0)
            };
            Ok(ChatResponse {
                message,
                usage: Usage::default(),
                model: "scripted".into(),
            })
        }
        async fn chat_structured(
            &self,
            _m: Vec<Message>,
            _s: serde_json::Value,
            _model: &str,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }
        async fn summarize(&self, _m: &[Message], _model: &str) -> String {
            String::new()
        }
        async fn extract_facts(&self, _m: &[Message], _model: &str) -> ExtractedFacts {
            ExtractedFacts::default()
        }
    }

    struct SendTool {
        port: Arc<RecordingPort>,
        seen_args: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Tool for SendTool {
        fn name(&self) -> &str {
            "send_message_to_user"
        }
        fn description(&self) -> &str {
            "Send a message to another user"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {
                "target_user": {"type": "string"},
                "message": {"type": "string"},
                "channel": {"type": "string"}
            }})
        }
        async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
            self.seen_args.lock().unwrap().push(args.clone());
            let target = args["target_user"].as_str().unwrap_or("?").to_string();
            let channel = args["channel"].as_str().unwrap_or("api").to_string();
            let message = args["message"].as_str().unwrap_or("").to_string();
            self.port
                .send(&target, &channel, &message)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "send_message_to_user".into(),
                    reason: e.to_string(),
                })?;
            Ok(format!("Message sent to {target}."))
        }
    }

    async fn dispatcher_with(
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        port: Arc<RecordingPort>,
    ) -> (Dispatcher, Store) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            provider,
            Arc::new(registry),
            port,
            store.clone(),
            Arc::new(EventBus::default()),
            "default-model",
            300,
        );
        (dispatcher, store)
    }

    fn plan(processor: ProcessorSpec) -> ExecutionPlan {
        ExecutionPlan {
            execution: Execution::Delayed,
            delay_seconds: Some(60),
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor,
        }
    }

    #[tokio::test]
    async fn static_processor_returns_text_for_delivery() {
        let port = Arc::new(RecordingPort::default());
        let (dispatcher, _store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(vec![]) }),
            ToolRegistry::new(),
            port,
        )
        .await;

        let outcome = dispatcher
            .run_plan(
                &plan(ProcessorSpec::Static { message: "Toplantı hatırlatma!".into() }),
                "toplantı",
                "telegram",
            )
            .await
            .unwrap();
        assert!(outcome.deliver);
        assert_eq!(outcome.response.as_deref(), Some("Toplantı hatırlatma!"));
    }

    #[tokio::test]
    async fn function_processor_invokes_tool_without_delivery() {
        let port = Arc::new(RecordingPort::default());
        let tool = Arc::new(SendTool {
            port: port.clone(),
            seen_args: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("messaging", tool.clone());

        let (dispatcher, _store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(vec![]) }),
            registry,
            port.clone(),
        )
        .await;

        let outcome = dispatcher
            .run_plan(
                &plan(ProcessorSpec::Function {
                    tool_name: "send_message_to_user".into(),
                    tool_args: serde_json::json!({"target_user": "Murat", "message": "naber"}),
                }),
                "task",
                "telegram",
            )
            .await
            .unwrap();

        // No scheduler-side delivery: the tool was the entire side effect
        assert!(!outcome.deliver);
        assert!(outcome.response.is_none());
        let sent = port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Murat");
        // Channel was injected from context
        let args = tool.seen_args.lock().unwrap();
        assert_eq!(args[0]["channel"], "telegram");
    }

    #[tokio::test]
    async fn function_processor_unknown_tool_is_error() {
        let port = Arc::new(RecordingPort::default());
        let (dispatcher, _store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(vec![]) }),
            ToolRegistry::new(),
            port,
        )
        .await;

        let err = dispatcher
            .run_plan(
                &plan(ProcessorSpec::Function {
                    tool_name: "ghost_tool".into(),
                    tool_args: serde_json::json!({}),
                }),
                "task",
                "api",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost_tool"));
    }

    #[tokio::test]
    async fn agent_processor_owns_delivery() {
        let port = Arc::new(RecordingPort::default());
        let tool = Arc::new(SendTool {
            port: port.clone(),
            seen_args: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("messaging", tool);

        let script = vec![
            Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "send_message_to_user".into(),
                    arguments: serde_json::json!({
                        "target_user": "Murat", "channel": "whatsapp",
                        "message": "hava güneşli"
                    }),
                }],
            ),
            Message::assistant("Report sent to Murat."),
        ];
        let (dispatcher, _store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(script) }),
            registry,
            port.clone(),
        )
        .await;

        let outcome = dispatcher
            .run_plan(
                &plan(ProcessorSpec::Agent {
                    prompt: "Send the weather to Murat on WhatsApp.".into(),
                    tools: vec!["send_message_to_user".into()],
                    model: None,
                }),
                "hava durumunu gönder",
                "whatsapp",
            )
            .await
            .unwrap();

        // Exactly one outbound message, sent by the agent itself
        assert!(!outcome.deliver);
        let sent = port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("Murat".into(), "whatsapp".into(), "hava güneşli".into()));
    }

    #[tokio::test]
    async fn deliver_queues_event_on_api_channel() {
        let port = Arc::new(RecordingPort {
            fail_channel: Some("api".into()),
            ..Default::default()
        });
        let (dispatcher, store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(vec![]) }),
            ToolRegistry::new(),
            port,
        )
        .await;

        let delivery = dispatcher
            .deliver("alice", "api", "Toplantı hatırlatma!", "reminder")
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Queued);

        let events = store.undelivered_events("alice").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, serde_json::json!("Toplantı hatırlatma!"));
    }

    #[tokio::test]
    async fn deliver_fails_hard_on_real_channels() {
        let port = Arc::new(RecordingPort {
            fail_channel: Some("telegram".into()),
            ..Default::default()
        });
        let (dispatcher, store) = dispatcher_with(
            Arc::new(ScriptedProvider { script: Mutex::new(vec![]) }),
            ToolRegistry::new(),
            port,
        )
        .await;

        assert!(dispatcher
            .deliver("alice", "telegram", "text", "reminder")
            .await
            .is_err());
        assert!(store.undelivered_events("alice").await.unwrap().is_empty());
    }

    #[test]
    fn skip_markers() {
        assert!(Dispatcher::should_skip("[SKIP]"));
        assert!(Dispatcher::should_skip("skip"));
        assert!(Dispatcher::should_skip("[no_notify]"));
        assert!(Dispatcher::should_skip("Nothing changed. [SKIP]"));
        assert!(Dispatcher::should_skip("   "));
        assert!(!Dispatcher::should_skip("Gold is at 3100 TL!"));
        assert!(!Dispatcher::should_skip("I decided to skip the details and report."));
    }
}
