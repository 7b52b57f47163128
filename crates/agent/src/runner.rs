//! GraphRunner — the orchestrator between the durable store and the
//! agent graph, and the only caller of the graph.
//!
//! One `process` call is one turn: resolve the session (rotating it when
//! the token budget is spent), materialize the conversation prefix,
//! invoke the graph, persist what it produced, and return the final
//! assistant text. Store or provider failures abort the turn after the
//! user message is persisted but before any assistant message, so the
//! next turn starts from a consistent state.

use std::sync::Arc;
use tracing::{debug, info, warn};

use graphbot_config::AppConfig;
use graphbot_core::error::Error;
use graphbot_core::message::{Message, Role, ToolCall};
use graphbot_core::provider::Provider;
use graphbot_core::tool::ToolRegistry;
use graphbot_store::{MessageRow, Store, CLOSE_TOKEN_LIMIT};

use crate::context::{ContextBuilder, SkillSource};
use crate::graph::AgentGraph;
use crate::limiter::RateLimiter;
use crate::permissions::RolePolicy;
use crate::state::AgentState;

const HISTORY_LIMIT: i64 = 50;
const SUMMARY_FALLBACK: &str = "Session closed due to token limit (summary unavailable).";

/// Request-scoped orchestrator. Shared behind an Arc; holds no per-turn
/// state.
pub struct GraphRunner {
    store: Store,
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    policy: Arc<RolePolicy>,
    graph: AgentGraph,
    limiter: RateLimiter,
    session_token_limit: i64,
    summary_model: String,
    auto_create_users: bool,
}

impl GraphRunner {
    pub fn new(
        config: &AppConfig,
        store: Store,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        policy: Arc<RolePolicy>,
        skills: Arc<dyn SkillSource>,
    ) -> Self {
        let context = Arc::new(ContextBuilder::new(
            store.clone(),
            config.assistant.clone(),
            skills,
        ));
        let graph = AgentGraph::new(
            provider.clone(),
            registry.clone(),
            context,
            store.clone(),
            config.assistant.model.clone(),
            config.assistant.temperature,
            config.assistant.iteration_limit,
        );
        Self {
            store,
            provider,
            registry,
            policy,
            graph,
            limiter: RateLimiter::new(config.auth.rate_limit.requests_per_minute),
            session_token_limit: config.assistant.session_token_limit as i64,
            summary_model: config.assistant.summary_model.clone(),
            auto_create_users: config.assistant.owner.is_none(),
        }
    }

    /// Process one user message. Returns `(reply, session_id)`.
    pub async fn process(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
    ) -> Result<(String, String), Error> {
        self.process_opts(user_id, channel, text, false).await
    }

    /// `skip_context = true` builds an identity-only system prompt —
    /// used by background turns to reduce cost.
    pub async fn process_opts(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
        skip_context: bool,
    ) -> Result<(String, String), Error> {
        // Quota check before any side effect
        if !self.limiter.check(user_id) {
            return Err(Error::RateLimited {
                user_id: user_id.to_string(),
                limit: self.limiter.limit(),
            });
        }

        // Resolve the user; auto-creation is off in owner mode
        let user = match self.store.get_user(user_id).await? {
            Some(user) => user,
            None if self.auto_create_users => {
                self.store
                    .get_or_create_user(user_id, None, self.policy.default_role())
                    .await?
            }
            None => return Err(Error::UserUnknown(user_id.to_string())),
        };
        let role = user.role;

        // RBAC resolution
        let allowed_tools = self.policy.allowed_tools(&role, &self.registry);
        let allowed_layers = self.policy.allowed_layers(&role);
        let max_sessions = self.policy.max_sessions(&role);

        // Session resolution: capped roles reuse any open session
        let mut session = if max_sessions == 1 {
            match self.store.get_any_open_session(user_id).await? {
                Some(existing) => existing,
                None => self.store.open_session(user_id, channel).await?,
            }
        } else {
            self.store.open_session(user_id, channel).await?
        };

        // Rotation check happens at the start of the turn
        if session.token_count >= self.session_token_limit {
            self.rotate_session(user_id, &session.session_id).await?;
            session = self.store.open_session(user_id, channel).await?;
        }
        let session_id = session.session_id.clone();

        // Conversation prefix
        let history_rows = self.store.recent_messages(&session_id, HISTORY_LIMIT).await?;
        let history = rows_to_messages(&history_rows);
        let history_len = history.len();

        // Persist the user message before the graph runs; an aborted turn
        // must still record what the user said
        self.store
            .append_message(&session_id, "user", text, None, None)
            .await?;

        let mut messages = history;
        messages.push(Message::user(text));
        let mut state = AgentState::new(user_id, &session_id, channel, &role, messages);
        state.allowed_tools = allowed_tools;
        state.allowed_layers = allowed_layers;
        state.skip_context = skip_context;

        self.graph.invoke(&mut state).await?;

        // Persist everything the graph appended (after prefix + user msg)
        for message in &state.messages[history_len + 1..] {
            match message.role {
                Role::Assistant => {
                    let tool_calls = (!message.tool_calls.is_empty())
                        .then(|| serde_json::to_value(&message.tool_calls))
                        .transpose()?;
                    self.store
                        .append_message(
                            &session_id,
                            "assistant",
                            &message.content,
                            tool_calls.as_ref(),
                            None,
                        )
                        .await?;
                }
                Role::Tool => {
                    self.store
                        .append_message(
                            &session_id,
                            "tool",
                            &message.content,
                            None,
                            message.tool_call_id.as_deref(),
                        )
                        .await?;
                }
                _ => {}
            }
        }

        // Fold this turn's usage into the session counter
        let new_total = session.token_count + state.token_count as i64;
        self.store.update_session_tokens(&session_id, new_total).await?;
        debug!(%session_id, tokens = new_total, "Turn persisted");

        Ok((state.final_response(), session_id))
    }

    /// Close a session over budget: summarize, extract facts, end it.
    /// Summary and extraction are best-effort; the close always happens.
    pub async fn rotate_session(&self, user_id: &str, session_id: &str) -> Result<(), Error> {
        info!(%session_id, "Token limit reached, rotating session");

        let rows = self.store.recent_messages(session_id, HISTORY_LIMIT).await?;
        let conversation: Vec<Message> = rows_to_messages(&rows)
            .into_iter()
            .filter(|m| {
                matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty()
            })
            .collect();

        let mut summary = String::new();
        if !conversation.is_empty() {
            summary = self
                .provider
                .summarize(&conversation, &self.summary_model)
                .await;
        }
        if summary.trim().is_empty() {
            summary = SUMMARY_FALLBACK.to_string();
        }

        if !conversation.is_empty() {
            let facts = self
                .provider
                .extract_facts(&conversation, &self.summary_model)
                .await;
            if !facts.is_empty() {
                self.save_extracted_facts(user_id, &facts).await;
            }
        }

        self.store
            .end_session(session_id, &summary, CLOSE_TOKEN_LIMIT)
            .await?;
        Ok(())
    }

    /// Persist extracted facts. Failures here must not block the close.
    async fn save_extracted_facts(
        &self,
        user_id: &str,
        facts: &graphbot_core::provider::ExtractedFacts,
    ) {
        if !facts.preferences.is_empty() {
            let map: serde_json::Map<String, serde_json::Value> = facts
                .preferences
                .iter()
                .map(|p| (p.key.clone(), serde_json::Value::String(p.value.clone())))
                .collect();
            if let Err(e) = self
                .store
                .merge_preferences(user_id, &serde_json::Value::Object(map))
                .await
            {
                warn!(error = %e, "Failed to save extracted preferences");
            }
        }
        for note in &facts.notes {
            if note.is_empty() {
                continue;
            }
            if let Err(e) = self.store.add_note(user_id, note, "extraction").await {
                warn!(error = %e, "Failed to save extracted note");
            }
        }
    }
}

/// Materialize stored rows as in-flight messages.
fn rows_to_messages(rows: &[MessageRow]) -> Vec<Message> {
    rows.iter()
        .filter_map(|row| {
            let role: Role = row.role.parse().ok()?;
            let mut message = match role {
                Role::User => Message::user(&row.content),
                Role::Assistant => {
                    let tool_calls: Vec<ToolCall> = row
                        .tool_calls
                        .clone()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    Message::assistant_with_tools(&row.content, tool_calls)
                }
                Role::Tool => Message::tool_result(
                    row.tool_call_id.clone().unwrap_or_default(),
                    &row.content,
                ),
                Role::System => return None, // system prompt is rebuilt per turn
            };
            message.created_at = row.created_at;
            Some(message)
        })
        .collect()
}
