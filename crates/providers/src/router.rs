//! Model-prefix routing over multiple providers.
//!
//! A model string like `openrouter/anthropic/claude-sonnet-4` is routed to
//! the provider registered for the `openrouter/` prefix; everything else
//! falls through to the default provider. This lets the planner run on a
//! cheap hosted model while the main agent uses another backend, behind
//! one `Provider` handle.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use graphbot_core::error::ProviderError;
use graphbot_core::message::Message;
use graphbot_core::provider::{ChatRequest, ChatResponse, ExtractedFacts, Provider};

/// Routes requests to providers by model-string prefix.
pub struct ProviderRouter {
    routes: Vec<(String, Arc<dyn Provider>)>,
    default: Arc<dyn Provider>,
}

impl ProviderRouter {
    pub fn new(default: Arc<dyn Provider>) -> Self {
        Self {
            routes: Vec::new(),
            default,
        }
    }

    /// Route models starting with `prefix` (e.g. `"openrouter/"`) to the
    /// given provider. First matching prefix wins.
    pub fn with_route(mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.routes.push((prefix.into(), provider));
        self
    }

    fn pick(&self, model: &str) -> &Arc<dyn Provider> {
        for (prefix, provider) in &self.routes {
            if model.starts_with(prefix.as_str()) {
                debug!(%model, provider = %provider.name(), "Routed by model prefix");
                return provider;
            }
        }
        &self.default
    }
}

#[async_trait]
impl Provider for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.pick(&request.model).chat(request).await
    }

    async fn chat_structured(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
        model: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        self.pick(model).chat_structured(messages, schema, model).await
    }

    async fn summarize(&self, messages: &[Message], model: &str) -> String {
        self.pick(model).summarize(messages, model).await
    }

    async fn extract_facts(&self, messages: &[Message], model: &str) -> ExtractedFacts {
        self.pick(model).extract_facts(messages, model).await
    }
}
