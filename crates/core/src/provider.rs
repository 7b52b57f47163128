//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and get a response
//! back. Beyond plain chat it exposes three specialized calls the runtime
//! depends on: schema-constrained structured output (delegation planning),
//! conversation summarization, and fact extraction (session rotation).
//!
//! Implementations: OpenAI-compatible endpoints, routed by model prefix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Message;

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// The model to use (e.g. "openrouter/anthropic/claude-sonnet-4")
    pub model: String,

    /// The conversation messages, system prompt first
    pub messages: Vec<Message>,

    /// Available tools the model can call
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic)
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// A complete chat response from a provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The generated assistant message (may carry tool calls and an opaque
    /// reasoning blob)
    pub message: Message,

    /// Token usage for this call
    pub usage: Usage,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Structured facts extracted from a conversation at session rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFacts {
    /// User preferences as key/value pairs, JSON-merged into the store
    #[serde(default)]
    pub preferences: Vec<PreferencePair>,

    /// Free-text facts about the user, stored as notes
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencePair {
    pub key: String,
    pub value: String,
}

impl ExtractedFacts {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty() && self.notes.is_empty()
    }
}

/// The core Provider trait.
///
/// `chat` and `chat_structured` propagate errors to the caller. `summarize`
/// and `extract_facts` are **best-effort**: they log failures and return
/// sentinel values (empty string / empty facts), never an error — session
/// rotation must not be collapsed by a failing summary call.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g. "openai-compat").
    fn name(&self) -> &str;

    /// Send a chat request and get a complete response.
    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Send a chat request constrained to a JSON schema and return the
    /// parsed object. Fails with `SchemaMismatch` rather than returning a
    /// non-conforming value.
    async fn chat_structured(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
        model: &str,
    ) -> std::result::Result<serde_json::Value, ProviderError>;

    /// Summarize a conversation for session rotation. Best-effort: returns
    /// an empty string on failure.
    async fn summarize(&self, messages: &[Message], model: &str) -> String;

    /// Extract structured user facts from a conversation. Best-effort:
    /// returns empty facts on failure.
    async fn extract_facts(&self, messages: &[Message], model: &str) -> ExtractedFacts;
}
