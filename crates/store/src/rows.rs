//! Typed rows mirroring the SQLite tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user account. `role` is one of "owner", "member", "guest".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Cross-channel identity: resolves `(channel, address)` to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLinkRow {
    pub user_id: String,
    pub channel: String,
    pub channel_address: String,
    pub metadata: serde_json::Value,
}

/// A conversation session — the unit over which the token budget is
/// enforced. At most one open (`ended_at IS NULL`) session exists per
/// `(user_id, channel)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub token_count: i64,
    pub close_reason: Option<String>,
}

impl SessionRow {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A persisted message. Append-only; ordering is by insertion id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A keyed agent memory record (e.g. key = "long_term").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryRow {
    pub user_id: String,
    pub key: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// A learned fact about a user. `source` is one of "conversation",
/// "extraction", "onboarding".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRow {
    pub id: i64,
    pub user_id: String,
    pub note: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// An activity log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: i64,
    pub user_id: String,
    pub item_id: Option<String>,
    pub item_title: String,
    pub activity_type: String,
    pub activity_date: String,
    pub created_at: DateTime<Utc>,
}

/// A favorited item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteRow {
    pub user_id: String,
    pub item_id: String,
    pub item_title: String,
    pub added_at: DateTime<Utc>,
}

/// A persisted cron job. Executed by the scheduler; auto-paused after
/// three consecutive failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobRow {
    pub job_id: String,
    pub user_id: String,
    pub cron_expr: String,
    pub message: String,
    pub channel: String,
    pub enabled: bool,
    pub processor: String,
    pub plan_json: Option<serde_json::Value>,
    pub notify_condition: String,
    pub consecutive_failures: i64,
    pub created_at: DateTime<Utc>,
}

/// Reminder status values.
pub mod reminder_status {
    pub const PENDING: &str = "pending";
    pub const SENT: &str = "sent";
    pub const CANCELLED: &str = "cancelled";
    pub const FAILED: &str = "failed";
}

/// A one-shot or recurring reminder. A reminder with `cron_expr` is
/// recurring and never leaves `pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderRow {
    pub reminder_id: String,
    pub user_id: String,
    pub channel: String,
    pub run_at: DateTime<Utc>,
    pub cron_expr: Option<String>,
    pub message: String,
    pub processor: String,
    pub plan_json: Option<serde_json::Value>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ReminderRow {
    pub fn is_recurring(&self) -> bool {
        self.cron_expr.is_some()
    }
}

/// Background task status values.
pub mod task_status {
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

/// An immediate background task spawned by the subagent worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTaskRow {
    pub task_id: String,
    pub user_id: String,
    pub parent_session: Option<String>,
    pub fallback_channel: String,
    pub status: String,
    pub plan: serde_json::Value,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One scheduled execution outcome. `status` is "success", "error", or
/// "skipped".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecutionRow {
    pub log_id: i64,
    pub job_id: String,
    pub executed_at: DateTime<Utc>,
    pub status: String,
    pub result: Option<String>,
    pub duration_ms: i64,
}

/// An issued API key (audit row; the key itself is stored hashed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRow {
    pub key_id: String,
    pub user_id: String,
    pub key_hash: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A delegation audit row: which task was planned into which plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationLogRow {
    pub id: i64,
    pub user_id: String,
    pub task: String,
    pub plan_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
