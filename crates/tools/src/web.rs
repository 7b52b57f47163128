//! Web fetch tool with configured shortcuts.
//!
//! A shortcut maps a short tag (e.g. `weather:istanbul`) to a full URL in
//! `[web.fetch_shortcuts]`, so planner prompts and scheduled agents can
//! reference stable names instead of raw URLs.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use graphbot_config::WebConfig;
use graphbot_core::error::ToolError;
use graphbot_core::tool::Tool;

const MAX_BODY_CHARS: usize = 8000;

/// Fetch a URL (or a configured shortcut) and return the response body.
pub struct WebFetchTool {
    client: reqwest::Client,
    shortcuts: HashMap<String, String>,
    timeout_secs: u64,
}

impl WebFetchTool {
    pub fn new(config: &WebConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            shortcuts: config.fetch_shortcuts.clone(),
            timeout_secs: config.timeout_secs,
        }
    }

    fn resolve(&self, url_or_tag: &str) -> Result<String, ToolError> {
        if let Some(url) = self.shortcuts.get(url_or_tag) {
            debug!(tag = %url_or_tag, %url, "Resolved fetch shortcut");
            return Ok(url.clone());
        }
        if url_or_tag.starts_with("http://") || url_or_tag.starts_with("https://") {
            return Ok(url_or_tag.to_string());
        }
        let known: Vec<&str> = self.shortcuts.keys().map(|s| s.as_str()).collect();
        Err(ToolError::InvalidArguments(format!(
            "'{url_or_tag}' is neither a URL nor a known shortcut (known: {})",
            known.join(", ")
        )))
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return the response body. Accepts a full http(s) \
         URL or a configured shortcut tag like 'weather:istanbul'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Full URL or shortcut tag"
                }
            },
            "required": ["url"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs + 5
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let url_or_tag = arguments["url"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("'url' is required".into()))?;
        let url = self.resolve(url_or_tag)?;

        let response = self.client.get(&url).send().await.map_err(|e| {
            ToolError::ExecutionFailed {
                tool_name: "web_fetch".into(),
                reason: e.to_string(),
            }
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "web_fetch".into(),
            reason: e.to_string(),
        })?;

        let mut body: String = body.chars().take(MAX_BODY_CHARS).collect();
        if !status.is_success() {
            body = format!("HTTP {} — {body}", status.as_u16());
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> WebFetchTool {
        let mut shortcuts = HashMap::new();
        shortcuts.insert(
            "weather:istanbul".to_string(),
            "https://wttr.in/istanbul?format=j1".to_string(),
        );
        WebFetchTool::new(&WebConfig {
            fetch_shortcuts: shortcuts,
            timeout_secs: 30,
        })
    }

    #[test]
    fn shortcut_resolves_to_url() {
        let url = tool().resolve("weather:istanbul").unwrap();
        assert_eq!(url, "https://wttr.in/istanbul?format=j1");
    }

    #[test]
    fn plain_urls_pass_through() {
        let url = tool().resolve("https://example.com/page").unwrap();
        assert_eq!(url, "https://example.com/page");
    }

    #[test]
    fn unknown_tag_is_invalid_with_hint() {
        let err = tool().resolve("weather:ankara").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("weather:ankara"));
        assert!(text.contains("weather:istanbul"));
    }

    #[tokio::test]
    async fn missing_url_argument_fails() {
        assert!(tool().execute(serde_json::json!({})).await.is_err());
    }
}
