//! Configuration loading, validation, and management for GraphBot.
//!
//! Loads configuration from a TOML file (default `graphbot.toml`) with
//! environment variable overrides, and the optional role-definition file
//! (`roles.toml`) that drives RBAC. Validates all settings at startup.

pub mod roles;

pub use roles::{RoleDef, RoleFile};

use graphbot_core::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure. Maps directly to `graphbot.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Assistant identity and model settings
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Background execution settings (delegation planner, timeouts)
    #[serde(default)]
    pub background: BackgroundConfig,

    /// Authentication and per-user quotas
    #[serde(default)]
    pub auth: AuthConfig,

    /// Channel activation and scoping, keyed by channel name
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,

    /// Outbound bot-voice marker for shared-identity transports.
    /// Also the inbound loop-break filter.
    #[serde(default = "default_bot_prefix")]
    pub bot_prefix: String,

    /// Web tool settings
    #[serde(default)]
    pub web: WebConfig,

    /// Optional retrieval wiring
    #[serde(default)]
    pub rag: RagConfig,

    /// Durable store settings
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_bot_prefix() -> String {
    "[gbot] ".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig::default(),
            background: BackgroundConfig::default(),
            auth: AuthConfig::default(),
            channels: HashMap::new(),
            bot_prefix: default_bot_prefix(),
            web: WebConfig::default(),
            rag: RagConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("assistant", &self.assistant)
            .field("background", &self.background)
            .field("auth", &self.auth)
            .field("channels", &self.channels)
            .field("bot_prefix", &self.bot_prefix)
            .field("web", &self.web)
            .field("rag", &self.rag)
            .field("store", &self.store)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Display name, also used in the default identity prompt
    #[serde(default = "default_name")]
    pub name: String,

    /// Owner-role user, derived at startup. None disables owner mode
    /// (channel identities auto-create users).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerConfig>,

    /// Default model for the main agent
    #[serde(default = "default_model")]
    pub model: String,

    /// Cheaper model used for summarization and fact extraction
    #[serde(default = "default_summary_model")]
    pub summary_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Session rotation threshold in provider-reported tokens
    #[serde(default = "default_session_token_limit")]
    pub session_token_limit: u32,

    /// Max reason ⇄ execute_tools loops per turn
    #[serde(default = "default_iteration_limit")]
    pub iteration_limit: u32,

    /// Identity prompt override. When None, the context builder falls back
    /// to the workspace identity file, then a built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Workspace directory (identity file, skills)
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

fn default_name() -> String {
    "GraphBot".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_summary_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_session_token_limit() -> u32 {
    30_000
}
fn default_iteration_limit() -> u32 {
    8
}
fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            owner: None,
            model: default_model(),
            summary_model: default_summary_model(),
            temperature: default_temperature(),
            session_token_limit: default_session_token_limit(),
            iteration_limit: default_iteration_limit(),
            identity: None,
            workspace: default_workspace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerConfig {
    /// The user_id that receives the `owner` role at startup
    pub username: String,

    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub delegation: DelegationConfig,

    /// Upper bound for agent-processor trigger execution
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
}

fn default_agent_timeout() -> u64 {
    300
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            delegation: DelegationConfig::default(),
            agent_timeout_secs: default_agent_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Planner model. None falls back to assistant.model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_planner_temperature")]
    pub temperature: f32,

    /// Deployment-specific examples appended to the planner prompt
    #[serde(default)]
    pub examples: Vec<String>,
}

fn default_planner_temperature() -> f32 {
    0.1
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: default_planner_temperature(),
            examples: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Empty string disables auth entirely (pass-through)
    #[serde(default)]
    pub jwt_secret_key: String,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        !self.jwt_secret_key.is_empty()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secret = if self.jwt_secret_key.is_empty() {
            "(disabled)"
        } else {
            "[REDACTED]"
        };
        f.debug_struct("AuthConfig")
            .field("jwt_secret_key", &secret)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RateLimitConfig {
    /// Per-user quota. 0 = unlimited.
    #[serde(default)]
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Group addresses the bot participates in. Empty = no groups.
    #[serde(default)]
    pub allowed_groups: Vec<String>,

    /// DM addresses the bot responds to. Empty = allow everyone.
    #[serde(default)]
    pub allowed_dms: Vec<String>,

    #[serde(default)]
    pub respond_to_dm: bool,

    /// Observe DMs without responding (context only)
    #[serde(default)]
    pub monitor_dm: bool,

    /// The bot has its own account on this transport; skip the bot-voice
    /// prefix.
    #[serde(default)]
    pub own_identity: bool,

    /// Max outbound message size before paragraph splitting
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
}

fn default_message_limit() -> usize {
    4000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_groups: Vec::new(),
            allowed_dms: Vec::new(),
            respond_to_dm: false,
            monitor_dm: false,
            own_identity: false,
            message_limit: default_message_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Mapping from short tag (e.g. "weather:istanbul") to URL, consulted
    /// by the web_fetch tool
    #[serde(default)]
    pub fetch_shortcuts: HashMap<String, String>,

    /// Per-request timeout for web tools
    #[serde(default = "default_web_timeout")]
    pub timeout_secs: u64,
}

fn default_web_timeout() -> u64 {
    30
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            fetch_shortcuts: HashMap::new(),
            timeout_secs: default_web_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub embedding_model: String,

    #[serde(default)]
    pub index_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/graphbot.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, apply env overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
                message: format!("Failed to read {}: {e}", path.display()),
            })?;
            toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse {}: {e}", path.display()),
            })?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (tests, embedded configs).
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config {
            message: format!("Failed to parse config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values:
    /// `GRAPHBOT_MODEL`, `GRAPHBOT_DB_PATH`, `GRAPHBOT_JWT_SECRET`.
    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("GRAPHBOT_MODEL") {
            if !model.is_empty() {
                self.assistant.model = model;
            }
        }
        if let Ok(path) = std::env::var("GRAPHBOT_DB_PATH") {
            if !path.is_empty() {
                self.store.path = path;
            }
        }
        if let Ok(secret) = std::env::var("GRAPHBOT_JWT_SECRET") {
            self.auth.jwt_secret_key = secret;
        }
    }

    /// Validate settings. Fatal at startup.
    pub fn validate(&self) -> Result<(), Error> {
        if self.assistant.model.trim().is_empty() {
            return Err(Error::Config {
                message: "assistant.model must not be empty".into(),
            });
        }
        if self.assistant.session_token_limit == 0 {
            return Err(Error::Config {
                message: "assistant.session_token_limit must be > 0".into(),
            });
        }
        if self.assistant.iteration_limit == 0 {
            return Err(Error::Config {
                message: "assistant.iteration_limit must be > 0".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.assistant.temperature) {
            return Err(Error::Config {
                message: format!(
                    "assistant.temperature {} out of range 0.0-2.0",
                    self.assistant.temperature
                ),
            });
        }
        Ok(())
    }

    /// The planner model: delegation override or the main assistant model.
    pub fn delegation_model(&self) -> &str {
        self.background
            .delegation
            .model
            .as_deref()
            .unwrap_or(&self.assistant.model)
    }

    /// Channel configuration by name, or a disabled default.
    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.channels.get(name).cloned().unwrap_or_default()
    }
}
