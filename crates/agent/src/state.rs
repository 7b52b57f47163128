//! Request-scoped graph state. One value per turn, never shared.

use std::collections::HashSet;

use graphbot_core::message::Message;

/// Everything a single turn through the agent graph carries.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub user_id: String,
    pub session_id: String,
    pub channel: String,
    pub role: String,

    /// Tools this turn may use. None = open policy (no filtering).
    pub allowed_tools: Option<HashSet<String>>,

    /// Context layers this turn receives. None = all layers.
    pub allowed_layers: Option<HashSet<String>>,

    /// Identity-only system prompt (background turns skip the full build)
    pub skip_context: bool,

    /// Set by load_context
    pub system_prompt: String,

    /// Conversation prefix plus everything this turn appends
    pub messages: Vec<Message>,

    /// reason-node invocations so far
    pub iteration: u32,

    /// Provider-reported tokens consumed this turn
    pub token_count: u32,
}

impl AgentState {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        channel: impl Into<String>,
        role: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            channel: channel.into(),
            role: role.into(),
            allowed_tools: None,
            allowed_layers: None,
            skip_context: false,
            system_prompt: String::new(),
            messages,
            iteration: 0,
            token_count: 0,
        }
    }

    /// The final assistant text: the last assistant message without tool
    /// calls.
    pub fn final_response(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| {
                m.role == graphbot_core::message::Role::Assistant
                    && !m.has_tool_calls()
                    && !m.content.is_empty()
            })
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}
