//! Error types for the GraphBot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all GraphBot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Delegation plan errors ---
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    // --- Scheduler errors ---
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    // --- Configuration errors (fatal at startup) ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Auth / quota (boundary errors, never cross into the graph) ---
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: user '{user_id}' exceeded {limit} requests/minute")]
    RateLimited { user_id: String, limit: u32 },

    // --- Unknown user with auto-creation disabled ---
    #[error("Unknown user: {0}")]
    UserUnknown(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Structured output did not match schema: {0}")]
    SchemaMismatch(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Not found: {entity} '{id}'")]
    NotFound { entity: &'static str, id: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("No {channel} link for user {user_id}")]
    NoLink { channel: String, user_id: String },

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool unavailable: {tool_name} — {reason}")]
    Unavailable { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: '{tool_name}' is not available for role '{role}'")]
    PermissionDenied { tool_name: String, role: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// Errors from delegation planning. Schema-invalid planner output is fatal
/// to the delegation attempt and surfaced to the caller — never silently
/// replaced by a fallback plan.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("Planner returned invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid plan: {0}")]
    Invalid(String),

    #[error("Plan references unknown tool '{0}'")]
    UnknownTool(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Reminder not found: {0}")]
    ReminderNotFound(String),

    #[error("Scheduler task is not running")]
    NotRunning,
}
