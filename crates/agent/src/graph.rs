//! The four-node agent graph: load_context → reason ⇄ execute_tools →
//! respond.
//!
//! Expressed as an explicit state machine rather than an async generator
//! so the iteration bound, tool ordering, and cancellation points stay
//! visible. The graph is compiled once at startup with the full tool set;
//! RBAC filtering is per-turn via [`AgentState::allowed_tools`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use graphbot_core::error::{Error, ToolError};
use graphbot_core::message::Message;
use graphbot_core::provider::{ChatRequest, Provider};
use graphbot_core::tool::ToolRegistry;
use graphbot_store::Store;

use crate::context::ContextBuilder;
use crate::state::AgentState;

/// Graph nodes. `Respond` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    LoadContext,
    Reason,
    ExecuteTools,
    Respond,
}

/// The compiled agent graph.
pub struct AgentGraph {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    context: Arc<ContextBuilder>,
    store: Store,
    model: String,
    temperature: f32,
    iteration_limit: u32,
}

impl AgentGraph {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        context: Arc<ContextBuilder>,
        store: Store,
        model: impl Into<String>,
        temperature: f32,
        iteration_limit: u32,
    ) -> Self {
        Self {
            provider,
            registry,
            context,
            store,
            model: model.into(),
            temperature,
            iteration_limit,
        }
    }

    /// Run one turn to completion. Mutates `state` in place; the caller
    /// reads the appended messages and final response from it.
    pub async fn invoke(&self, state: &mut AgentState) -> Result<(), Error> {
        let mut node = Node::LoadContext;
        loop {
            node = match node {
                Node::LoadContext => self.load_context(state).await?,
                Node::Reason => self.reason(state).await?,
                Node::ExecuteTools => self.execute_tools(state).await?,
                Node::Respond => {
                    self.respond(state);
                    return Ok(());
                }
            };
        }
    }

    /// Build the system prompt. `skip_context` turns get identity only;
    /// full turns also consume undelivered events (marked delivered here).
    async fn load_context(&self, state: &mut AgentState) -> Result<Node, Error> {
        if state.skip_context {
            state.system_prompt = self.context.identity_prompt();
            debug!(user_id = %state.user_id, "Lightweight context (identity only)");
        } else {
            let built = self
                .context
                .build(&state.user_id, &state.role, state.allowed_layers.as_ref())
                .await?;
            if !built.event_ids.is_empty() {
                self.store.mark_events_delivered(&built.event_ids).await?;
            }
            state.system_prompt = built.system_prompt;
            debug!(
                user_id = %state.user_id,
                role = %state.role,
                events = built.event_ids.len(),
                "Context built"
            );
        }
        Ok(Node::Reason)
    }

    /// One LLM call with the role-filtered tool definitions. A provider
    /// failure becomes a synthetic assistant message — the turn still
    /// completes and the error is visible to the user.
    async fn reason(&self, state: &mut AgentState) -> Result<Node, Error> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        messages.push(Message::system(&state.system_prompt));
        messages.extend(state.messages.iter().cloned());

        let tools = self.registry.definitions(state.allowed_tools.as_ref());
        let request = ChatRequest::new(&self.model, messages)
            .with_tools(tools)
            .with_temperature(self.temperature);

        state.iteration += 1;
        let response = match self.provider.chat(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Provider error in reason node");
                state.messages.push(Message::assistant(format!("(model error: {e})")));
                return Ok(Node::Respond);
            }
        };

        state.token_count += response.usage.total_tokens;
        let has_tool_calls = response.message.has_tool_calls();
        if has_tool_calls {
            debug!(
                tools = ?response.message.tool_calls.iter().map(|tc| tc.name.as_str()).collect::<Vec<_>>(),
                "LLM requested tool calls"
            );
        }
        state.messages.push(response.message);

        if state.iteration >= self.iteration_limit {
            if has_tool_calls {
                warn!(
                    iteration = state.iteration,
                    limit = self.iteration_limit,
                    "Iteration limit reached, forcing respond"
                );
            }
            return Ok(Node::Respond);
        }
        if has_tool_calls {
            Ok(Node::ExecuteTools)
        } else {
            Ok(Node::Respond)
        }
    }

    /// Execute the last assistant message's tool calls in order. The RBAC
    /// guard here is the second layer — the LLM already saw a filtered
    /// tool list, but a hallucinated name must not execute.
    async fn execute_tools(&self, state: &mut AgentState) -> Result<Node, Error> {
        let calls = state
            .messages
            .last()
            .map(|m| m.tool_calls.clone())
            .unwrap_or_default();

        for call in calls {
            let denied = state
                .allowed_tools
                .as_ref()
                .map(|allowed| !allowed.contains(&call.name))
                .unwrap_or(false);

            let result_text = if denied {
                warn!(
                    user_id = %state.user_id,
                    role = %state.role,
                    tool = %call.name,
                    "RBAC denied tool call"
                );
                format!(
                    "Permission denied: '{}' is not available for role '{}'.",
                    call.name, state.role
                )
            } else {
                match self.registry.get_available(&call.name) {
                    Err(e) => format!("Tool error: {e}"),
                    Ok(tool) => {
                        let mut args = call.arguments.clone();
                        inject_channel(&mut args, &tool.parameters_schema(), &state.channel);
                        debug!(tool = %call.name, "Executing tool");
                        let timeout = Duration::from_secs(tool.timeout_secs());
                        match tokio::time::timeout(timeout, tool.execute(args)).await {
                            Ok(Ok(output)) => output,
                            Ok(Err(e)) => format!("Tool error: {e}"),
                            Err(_) => format!(
                                "Tool error: {}",
                                ToolError::Timeout {
                                    tool_name: call.name.clone(),
                                    timeout_secs: tool.timeout_secs(),
                                }
                            ),
                        }
                    }
                }
            };
            state.messages.push(Message::tool_result(&call.id, result_text));
        }
        Ok(Node::Reason)
    }

    /// Terminal node. Token accounting already happened per-call in
    /// reason; the runner consumes the final message.
    fn respond(&self, state: &AgentState) {
        debug!(
            session_id = %state.session_id,
            iterations = state.iteration,
            tokens = state.token_count,
            "Turn complete"
        );
    }
}

/// Inject the session channel into tools that declare a `channel`
/// parameter the LLM left unset. An explicit LLM choice is kept.
fn inject_channel(args: &mut serde_json::Value, schema: &serde_json::Value, channel: &str) {
    let declares_channel = schema
        .get("properties")
        .and_then(|p| p.get("channel"))
        .is_some();
    if !declares_channel {
        return;
    }
    if let Some(object) = args.as_object_mut() {
        let missing = object
            .get("channel")
            .map(|v| v.is_null() || v.as_str().map(|s| s.is_empty()).unwrap_or(false))
            .unwrap_or(true);
        if missing {
            debug!(%channel, "Channel injected into tool arguments");
            object.insert("channel".into(), serde_json::Value::String(channel.into()));
        }
    } else if args.is_null() {
        *args = serde_json::json!({ "channel": channel });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticSkills;
    use async_trait::async_trait;
    use graphbot_config::AssistantConfig;
    use graphbot_core::error::ProviderError;
    use graphbot_core::message::{Role, ToolCall};
    use graphbot_core::provider::{ChatResponse, ExtractedFacts, Usage};
    use graphbot_core::tool::Tool;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted responses; after the script is exhausted, returns
    /// a plain text message (tool-loop fixtures never terminate on their
    /// own).
    struct ScriptedProvider {
        script: Mutex<Vec<Message>>,
        fallback: String,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Message>) -> Self {
            Self {
                script: Mutex::new(script),
                fallback: "fallback answer".into(),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let message = if script.is_empty() {
                Message::assistant(&self.fallback)
            } else {
                script.remove(0)
            };
            Ok(ChatResponse {
                message,
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
                model: "scripted".into(),
            })
        }

        async fn chat_structured(
            &self,
            _messages: Vec<Message>,
            _schema: serde_json::Value,
            _model: &str,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }

        async fn summarize(&self, _messages: &[Message], _model: &str) -> String {
            String::new()
        }

        async fn extract_facts(&self, _messages: &[Message], _model: &str) -> ExtractedFacts {
            ExtractedFacts::default()
        }
    }

    struct RecordingTool {
        executed: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "Read a file"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "channel": {"type": "string"}
                }
            })
        }
        async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
            self.executed.lock().unwrap().push(args);
            Ok("file contents".into())
        }
    }

    async fn graph_with(
        provider: Arc<ScriptedProvider>,
        registry: ToolRegistry,
        iteration_limit: u32,
    ) -> (AgentGraph, Store) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let context = Arc::new(ContextBuilder::new(
            store.clone(),
            AssistantConfig::default(),
            Arc::new(StaticSkills::default()),
        ));
        let graph = AgentGraph::new(
            provider,
            Arc::new(registry),
            context,
            store.clone(),
            "test-model",
            0.7,
            iteration_limit,
        );
        (graph, store)
    }

    fn tool_call_message(name: &str, args: serde_json::Value) -> Message {
        Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: name.into(),
                arguments: args,
            }],
        )
    }

    #[tokio::test]
    async fn plain_text_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![Message::assistant("hello!")]));
        let (graph, _store) = graph_with(provider.clone(), ToolRegistry::new(), 8).await;

        let mut state =
            AgentState::new("alice", "s1", "api", "member", vec![Message::user("hi")]);
        graph.invoke(&mut state).await.unwrap();

        assert_eq!(state.final_response(), "hello!");
        assert_eq!(state.token_count, 15);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let tool = Arc::new(RecordingTool {
            executed: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("filesystem", tool.clone());

        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_message("read_file", serde_json::json!({"path": "notes.txt"})),
            Message::assistant("the file says hi"),
        ]));
        let (graph, _store) = graph_with(provider, registry, 8).await;

        let mut state = AgentState::new(
            "alice",
            "s1",
            "telegram",
            "member",
            vec![Message::user("read notes.txt")],
        );
        graph.invoke(&mut state).await.unwrap();

        assert_eq!(state.final_response(), "the file says hi");
        // user, assistant(tool_calls), tool, assistant
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[2].role, Role::Tool);
        assert_eq!(state.messages[2].content, "file contents");

        // Channel was injected because the schema declares it
        let executed = tool.executed.lock().unwrap();
        assert_eq!(executed[0]["channel"], "telegram");
        assert_eq!(executed[0]["path"], "notes.txt");
    }

    #[tokio::test]
    async fn rbac_guard_blocks_hallucinated_tool() {
        let tool = Arc::new(RecordingTool {
            executed: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("filesystem", tool.clone());

        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_message("read_file", serde_json::json!({"path": "/etc/passwd"})),
            Message::assistant("I could not read the file."),
        ]));
        let (graph, _store) = graph_with(provider, registry, 8).await;

        let mut state = AgentState::new(
            "guest1",
            "s1",
            "api",
            "guest",
            vec![Message::user("dosyayı oku")],
        );
        state.allowed_tools = Some(HashSet::new()); // guest: nothing allowed

        graph.invoke(&mut state).await.unwrap();

        // Synthetic permission-denied tool result, tool never executed
        let tool_msg = state
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("Permission denied"));
        assert!(tool_msg.content.contains("guest"));
        assert!(tool.executed.lock().unwrap().is_empty());
        // The graph continued and produced a final answer
        assert_eq!(state.final_response(), "I could not read the file.");
    }

    #[tokio::test]
    async fn iteration_limit_bounds_llm_calls() {
        // Script an endless tool loop; the fixture never stops on its own
        let looping: Vec<Message> = (0..20)
            .map(|_| tool_call_message("read_file", serde_json::json!({"path": "x"})))
            .collect();
        let tool = Arc::new(RecordingTool {
            executed: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("filesystem", tool);

        let provider = Arc::new(ScriptedProvider::new(looping));
        let limit = 8;
        let (graph, _store) = graph_with(provider.clone(), registry, limit).await;

        let mut state =
            AgentState::new("alice", "s1", "api", "member", vec![Message::user("loop")]);
        graph.invoke(&mut state).await.unwrap();

        assert!(provider.call_count() as u32 <= limit + 1);
        assert_eq!(state.iteration, limit);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_message() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_message("no_such_tool", serde_json::json!({})),
            Message::assistant("sorry"),
        ]));
        let (graph, _store) = graph_with(provider, ToolRegistry::new(), 8).await;

        let mut state =
            AgentState::new("alice", "s1", "api", "member", vec![Message::user("go")]);
        graph.invoke(&mut state).await.unwrap();

        let tool_msg = state
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("not found"));
    }

    #[tokio::test]
    async fn every_tool_call_gets_a_result_in_order() {
        let message = Message::assistant_with_tools(
            "",
            vec![
                ToolCall {
                    id: "c1".into(),
                    name: "read_file".into(),
                    arguments: serde_json::json!({"path": "a"}),
                },
                ToolCall {
                    id: "c2".into(),
                    name: "blocked_tool".into(),
                    arguments: serde_json::json!({}),
                },
            ],
        );
        let tool = Arc::new(RecordingTool {
            executed: Mutex::new(vec![]),
        });
        let mut registry = ToolRegistry::new();
        registry.register("filesystem", tool);

        let provider = Arc::new(ScriptedProvider::new(vec![
            message,
            Message::assistant("done"),
        ]));
        let (graph, _store) = graph_with(provider, registry, 8).await;

        let mut state =
            AgentState::new("alice", "s1", "api", "member", vec![Message::user("go")]);
        let mut allowed = HashSet::new();
        allowed.insert("read_file".to_string());
        state.allowed_tools = Some(allowed);

        graph.invoke(&mut state).await.unwrap();

        let tool_results: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_results.len(), 2);
        assert_eq!(tool_results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_results[0].content, "file contents");
        assert_eq!(tool_results[1].tool_call_id.as_deref(), Some("c2"));
        assert!(tool_results[1].content.contains("Permission denied"));
    }

    #[test]
    fn inject_channel_respects_explicit_value() {
        let schema = serde_json::json!({"properties": {"channel": {"type": "string"}}});
        let mut args = serde_json::json!({"channel": "whatsapp"});
        inject_channel(&mut args, &schema, "telegram");
        assert_eq!(args["channel"], "whatsapp");

        let mut args = serde_json::json!({"other": 1});
        inject_channel(&mut args, &schema, "telegram");
        assert_eq!(args["channel"], "telegram");

        let no_channel_schema = serde_json::json!({"properties": {"path": {}}});
        let mut args = serde_json::json!({});
        inject_channel(&mut args, &no_channel_schema, "telegram");
        assert!(args.get("channel").is_none());
    }
}
