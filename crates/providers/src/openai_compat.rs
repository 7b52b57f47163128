//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `/v1/chat/completions`. Supports tool calling,
//! schema-constrained structured output, and opaque reasoning-content
//! round-trips for thinking models.
//!
//! `summarize` and `extract_facts` are best-effort by contract: failures
//! are logged and collapse to sentinel values, never errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use graphbot_core::error::ProviderError;
use graphbot_core::message::{Message, Role, ToolCall};
use graphbot_core::provider::{
    ChatRequest, ChatResponse, ExtractedFacts, Provider, ToolDefinition, Usage,
};

const SUMMARY_PROMPT: &str = "You are a conversation summarizer. Produce a concise summary in this format:\n\n\
First, write a brief narrative summary (2-4 sentences) capturing the main flow \
of the conversation, key decisions, and context.\n\n\
Then add structured bullets:\n\
- TOPICS: Main subjects discussed\n\
- DECISIONS: Choices made or preferences expressed\n\
- PENDING: Unresolved questions or next steps\n\
- USER_INFO: New personal information learned about the user\n\n\
Write in the same language as the conversation. \
Keep total output under 300 words. Skip sections with no content. \
Do NOT include greetings or filler.";

const EXTRACT_PROMPT: &str = "Analyze this conversation and extract structured facts as JSON.\n\
Return a JSON object with these optional keys:\n\
- \"preferences\": user preferences as [{\"key\": \"...\", \"value\": \"...\"}]\n\
- \"notes\": important facts about the user as [\"...\"]\n\n\
Rules:\n\
- Only extract clearly stated facts, not assumptions\n\
- Preferences = explicit likes/dislikes/settings (e.g. language, style)\n\
- Notes = personal facts (job, interests, ongoing projects)\n\
- Skip greetings, filler, and technical tool details\n\
- Return {} if nothing worth extracting";

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// OpenRouter convenience constructor.
    pub fn openrouter(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// OpenAI convenience constructor.
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Ollama convenience constructor (no real key needed).
    pub fn ollama(base_url: Option<&str>) -> Result<Self, ProviderError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama",
        )
    }

    /// Convert domain messages to the API wire format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                kind: "function".into(),
                                function: ApiFunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
                // Thinking models require their reasoning blob echoed back
                reasoning_content: m.reasoning.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Option<Vec<ApiTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|t| ApiTool {
                    kind: "function".into(),
                    function: ApiToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    }

    /// Parse the API response message into a domain Message.
    fn from_api_message(api: ApiResponseMessage) -> Message {
        let tool_calls = api
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();
        Message {
            role: Role::Assistant,
            content: api.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
            reasoning: api.reasoning_content,
            created_at: chrono::Utc::now(),
        }
    }

    async fn post_completion(
        &self,
        body: &ApiChatRequest,
    ) -> Result<ApiChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %body.model, "Chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::AuthenticationFailed(text),
                404 => ProviderError::ModelNotFound(body.model.clone()),
                429 => ProviderError::RateLimited {
                    retry_after_secs: 30,
                },
                code => ProviderError::ApiError {
                    status_code: code,
                    message: text,
                },
            });
        }

        response
            .json::<ApiChatResponse>()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }

    /// Parse structured-output content, tolerating markdown fences and
    /// reasoning-model preambles around the JSON object.
    fn parse_structured(content: &str) -> Result<serde_json::Value, ProviderError> {
        let mut clean = content.trim();
        if let Some(fenced) = clean.split("```").nth(1) {
            clean = fenced.strip_prefix("json").unwrap_or(fenced).trim();
        }
        if let Ok(value) = serde_json::from_str(clean) {
            return Ok(value);
        }
        // Extract the first top-level JSON object from surrounding text
        if let (Some(start), Some(end)) = (clean.find('{'), clean.rfind('}')) {
            if end > start {
                if let Ok(value) = serde_json::from_str(&clean[start..=end]) {
                    return Ok(value);
                }
            }
        }
        let preview: String = content.chars().take(120).collect();
        Err(ProviderError::SchemaMismatch(format!(
            "not valid JSON: {preview}"
        )))
    }

    /// Check the parsed value against the schema's required top-level keys.
    fn check_required(
        value: &serde_json::Value,
        schema: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        let Some(object) = value.as_object() else {
            return Err(ProviderError::SchemaMismatch(
                "structured output is not an object".into(),
            ));
        };
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !object.contains_key(key) {
                    return Err(ProviderError::SchemaMismatch(format!(
                        "missing required key '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = ApiChatRequest {
            model: request.model.clone(),
            messages: Self::to_api_messages(&request.messages),
            tools: Self::to_api_tools(&request.tools),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: None,
        };
        let api = self.post_completion(&body).await?;
        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("no choices".into()))?;

        Ok(ChatResponse {
            message: Self::from_api_message(choice.message),
            usage: api.usage.map(Into::into).unwrap_or_default(),
            model: api.model.unwrap_or(request.model),
        })
    }

    async fn chat_structured(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
        model: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let body = ApiChatRequest {
            model: model.to_string(),
            messages: Self::to_api_messages(&messages),
            tools: None,
            temperature: 0.1,
            max_tokens: Some(1024),
            response_format: Some(serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "strict": true,
                    "schema": schema,
                },
            })),
        };
        let api = self.post_completion(&body).await?;
        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("no choices".into()))?;

        // Some thinking models put the payload in reasoning_content
        let mut content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            if let Some(serde_json::Value::String(s)) = &choice.message.reasoning_content {
                content = s.clone();
            }
        }

        let value = Self::parse_structured(&content)?;
        Self::check_required(&value, &schema)?;
        Ok(value)
    }

    async fn summarize(&self, messages: &[Message], model: &str) -> String {
        let mut convo = vec![Message::system(SUMMARY_PROMPT)];
        convo.extend(messages.iter().cloned());
        convo.push(Message::user("Summarize this conversation concisely."));

        let request = ChatRequest::new(model, convo)
            .with_temperature(0.3)
            .with_max_tokens(500);
        match self.chat(request).await {
            Ok(response) => response.message.content,
            Err(e) => {
                warn!(provider = %self.name, error = %e, "Summarization failed, returning sentinel");
                String::new()
            }
        }
    }

    async fn extract_facts(&self, messages: &[Message], model: &str) -> ExtractedFacts {
        let mut convo = vec![Message::system(EXTRACT_PROMPT)];
        convo.extend(messages.iter().cloned());
        convo.push(Message::user("Extract facts as JSON."));

        let request = ChatRequest::new(model, convo)
            .with_temperature(0.1)
            .with_max_tokens(300);
        let content = match self.chat(request).await {
            Ok(response) => response.message.content,
            Err(e) => {
                warn!(provider = %self.name, error = %e, "Fact extraction failed, returning sentinel");
                return ExtractedFacts::default();
            }
        };

        match Self::parse_structured(&content) {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(_) => {
                warn!(provider = %self.name, "Fact extraction returned non-JSON, returning sentinel");
                ExtractedFacts::default()
            }
        }
    }
}

// ── API wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default)]
    reasoning_content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}
