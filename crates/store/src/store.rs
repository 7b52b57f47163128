//! Store construction, schema migration, users, and channel identity.

use chrono::{DateTime, Utc};
use graphbot_core::error::StoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use crate::rows::{ChannelLinkRow, UserRow};

/// The durable SQLite store. Cheap to clone (pool handle).
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database
    /// (useful for tests).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("Store initialized at {path}");
        Ok(store)
    }

    /// Run schema migrations. Idempotent.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }
        debug!("Store migrations complete");
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────────

    /// Fetch a user, creating one with the given role if absent.
    pub async fn get_or_create_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        default_role: &str,
    ) -> Result<UserRow, StoreError> {
        if let Some(user) = self.get_user(user_id).await? {
            return Ok(user);
        }
        sqlx::query(
            "INSERT OR IGNORE INTO users (user_id, display_name, role, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(default_role)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT user: {e}")))?;
        info!(%user_id, role = %default_role, "New user created");

        self.get_user(user_id).await?.ok_or(StoreError::NotFound {
            entity: "user",
            id: user_id.to_string(),
        })
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT user: {e}")))?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<UserRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT users: {e}")))?;
        rows.iter().map(user_from_row).collect()
    }

    /// Set a user's role. Only the owner may call this at the API layer;
    /// the store does not enforce the caller.
    pub async fn set_user_role(&self, user_id: &str, role: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET role = ?1 WHERE user_id = ?2")
            .bind(role)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE role: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    /// Ensure the configured owner user exists with the `owner` role.
    /// Called once at startup; demotes nobody.
    pub async fn ensure_owner(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<UserRow, StoreError> {
        let name = (!display_name.is_empty()).then_some(display_name);
        self.get_or_create_user(username, name, "owner").await?;
        self.set_user_role(username, "owner").await?;
        self.get_user(username).await?.ok_or(StoreError::NotFound {
            entity: "user",
            id: username.to_string(),
        })
    }

    // ── Channel links ─────────────────────────────────────────────────────

    /// Link a channel identity to a user. Replaces any existing link for
    /// the same `(channel, address)` pair.
    pub async fn link_channel(
        &self,
        user_id: &str,
        channel: &str,
        channel_address: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO channel_links (user_id, channel, channel_address, metadata)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(channel)
        .bind(channel_address)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT channel_link: {e}")))?;
        Ok(())
    }

    /// Resolve an external `(channel, address)` identity to a user id.
    pub async fn resolve_channel(
        &self,
        channel: &str,
        channel_address: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id FROM channel_links WHERE channel = ?1 AND channel_address = ?2",
        )
        .bind(channel)
        .bind(channel_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT channel_link: {e}")))?;
        Ok(row.and_then(|r| r.try_get("user_id").ok()))
    }

    /// Get a user's link for a channel (delivery addressing).
    pub async fn get_channel_link(
        &self,
        user_id: &str,
        channel: &str,
    ) -> Result<Option<ChannelLinkRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM channel_links WHERE user_id = ?1 AND channel = ?2",
        )
        .bind(user_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT channel_link: {e}")))?;
        row.map(|r| {
            Ok(ChannelLinkRow {
                user_id: column(&r, "user_id")?,
                channel: column(&r, "channel")?,
                channel_address: column(&r, "channel_address")?,
                metadata: json_column(&r, "metadata")?,
            })
        })
        .transpose()
    }
}

// ── Row mapping helpers (shared by the other impl files) ─────────────────

pub(crate) fn column<T>(row: &sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

pub(crate) fn ts_column(
    row: &sqlx::sqlite::SqliteRow,
    name: &str,
) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = column(row, name)?;
    Ok(parse_ts(&raw))
}

pub(crate) fn opt_ts_column(
    row: &sqlx::sqlite::SqliteRow,
    name: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = column(row, name)?;
    Ok(raw.map(|s| parse_ts(&s)))
}

pub(crate) fn json_column(
    row: &sqlx::sqlite::SqliteRow,
    name: &str,
) -> Result<serde_json::Value, StoreError> {
    let raw: String = column(row, name)?;
    Ok(serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null))
}

pub(crate) fn opt_json_column(
    row: &sqlx::sqlite::SqliteRow,
    name: &str,
) -> Result<Option<serde_json::Value>, StoreError> {
    let raw: Option<String> = column(row, name)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        user_id: column(row, "user_id")?,
        display_name: column(row, "display_name")?,
        password_hash: column(row, "password_hash")?,
        role: column(row, "role")?,
        created_at: ts_column(row, "created_at")?,
    })
}

// ── Schema ───────────────────────────────────────────────────────────────

const SCHEMA: &[(&str, &str)] = &[
    (
        "users",
        "CREATE TABLE IF NOT EXISTS users (
            user_id       TEXT PRIMARY KEY,
            display_name  TEXT,
            password_hash TEXT,
            role          TEXT NOT NULL DEFAULT 'guest',
            created_at    TEXT NOT NULL
        )",
    ),
    (
        "channel_links",
        "CREATE TABLE IF NOT EXISTS channel_links (
            user_id         TEXT NOT NULL,
            channel         TEXT NOT NULL,
            channel_address TEXT NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (channel, channel_address),
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "sessions",
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id   TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL,
            channel      TEXT NOT NULL DEFAULT 'api',
            started_at   TEXT NOT NULL,
            ended_at     TEXT,
            summary      TEXT,
            token_count  INTEGER NOT NULL DEFAULT 0,
            close_reason TEXT,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "sessions index",
        "CREATE INDEX IF NOT EXISTS idx_sessions_user
         ON sessions(user_id, channel, started_at DESC)",
    ),
    (
        "open session uniqueness",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_open
         ON sessions(user_id, channel) WHERE ended_at IS NULL",
    ),
    (
        "messages",
        "CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL DEFAULT '',
            tool_calls   TEXT,
            tool_call_id TEXT,
            created_at   TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(session_id)
        )",
    ),
    (
        "messages index",
        "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id)",
    ),
    (
        "agent_memory",
        "CREATE TABLE IF NOT EXISTS agent_memory (
            user_id    TEXT NOT NULL DEFAULT '',
            key        TEXT NOT NULL,
            content    TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        )",
    ),
    (
        "user_notes",
        "CREATE TABLE IF NOT EXISTS user_notes (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL,
            note       TEXT NOT NULL,
            source     TEXT NOT NULL DEFAULT 'conversation',
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "user_notes index",
        "CREATE INDEX IF NOT EXISTS idx_notes_user ON user_notes(user_id, id DESC)",
    ),
    (
        "activity_logs",
        "CREATE TABLE IF NOT EXISTS activity_logs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            item_id       TEXT,
            item_title    TEXT NOT NULL,
            activity_type TEXT NOT NULL DEFAULT 'used',
            activity_date TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "activity index",
        "CREATE INDEX IF NOT EXISTS idx_activity_user
         ON activity_logs(user_id, activity_date DESC)",
    ),
    (
        "favorites",
        "CREATE TABLE IF NOT EXISTS favorites (
            user_id    TEXT NOT NULL,
            item_id    TEXT NOT NULL,
            item_title TEXT NOT NULL,
            added_at   TEXT NOT NULL,
            PRIMARY KEY (user_id, item_id),
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "preferences",
        "CREATE TABLE IF NOT EXISTS preferences (
            user_id    TEXT PRIMARY KEY,
            data       TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "cron_jobs",
        "CREATE TABLE IF NOT EXISTS cron_jobs (
            job_id               TEXT PRIMARY KEY,
            user_id              TEXT NOT NULL,
            cron_expr            TEXT NOT NULL,
            message              TEXT NOT NULL,
            channel              TEXT NOT NULL DEFAULT 'api',
            enabled              INTEGER NOT NULL DEFAULT 1,
            processor            TEXT NOT NULL DEFAULT 'agent',
            plan_json            TEXT,
            notify_condition     TEXT NOT NULL DEFAULT 'always',
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "reminders",
        "CREATE TABLE IF NOT EXISTS reminders (
            reminder_id TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            channel     TEXT NOT NULL DEFAULT 'api',
            run_at      TEXT NOT NULL,
            cron_expr   TEXT,
            message     TEXT NOT NULL DEFAULT '',
            processor   TEXT NOT NULL DEFAULT 'static',
            plan_json   TEXT,
            status      TEXT NOT NULL DEFAULT 'pending',
            created_at  TEXT NOT NULL,
            sent_at     TEXT,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "background_tasks",
        "CREATE TABLE IF NOT EXISTS background_tasks (
            task_id          TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL,
            parent_session   TEXT,
            fallback_channel TEXT NOT NULL DEFAULT 'api',
            status           TEXT NOT NULL DEFAULT 'running',
            plan             TEXT NOT NULL,
            result           TEXT,
            error            TEXT,
            started_at       TEXT NOT NULL,
            completed_at     TEXT,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "system_events",
        "CREATE TABLE IF NOT EXISTS system_events (
            event_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      TEXT NOT NULL,
            kind         TEXT NOT NULL,
            payload      TEXT NOT NULL DEFAULT 'null',
            delivered_at TEXT,
            created_at   TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "system_events index",
        "CREATE INDEX IF NOT EXISTS idx_events_undelivered
         ON system_events(user_id, delivered_at)",
    ),
    (
        "cron_execution_log",
        "CREATE TABLE IF NOT EXISTS cron_execution_log (
            log_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            status      TEXT NOT NULL,
            result      TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "execution log index",
        "CREATE INDEX IF NOT EXISTS idx_cron_log_job
         ON cron_execution_log(job_id, log_id DESC)",
    ),
    (
        "api_keys",
        "CREATE TABLE IF NOT EXISTS api_keys (
            key_id       TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL,
            key_hash     TEXT NOT NULL,
            label        TEXT NOT NULL DEFAULT '',
            created_at   TEXT NOT NULL,
            last_used_at TEXT,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )",
    ),
    (
        "delegation_logs",
        "CREATE TABLE IF NOT EXISTS delegation_logs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL,
            task       TEXT NOT NULL,
            plan_json  TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_user() {
        let store = test_store().await;
        let user = store
            .get_or_create_user("alice", Some("Alice"), "member")
            .await
            .unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.role, "member");

        // Second call returns the existing row, role unchanged
        let again = store
            .get_or_create_user("alice", None, "guest")
            .await
            .unwrap();
        assert_eq!(again.role, "member");
    }

    #[tokio::test]
    async fn set_role_requires_existing_user() {
        let store = test_store().await;
        assert!(store.set_user_role("ghost", "member").await.is_err());

        store
            .get_or_create_user("bob", None, "guest")
            .await
            .unwrap();
        store.set_user_role("bob", "member").await.unwrap();
        assert_eq!(store.get_user("bob").await.unwrap().unwrap().role, "member");
    }

    #[tokio::test]
    async fn ensure_owner_promotes() {
        let store = test_store().await;
        store
            .get_or_create_user("ihsan", None, "guest")
            .await
            .unwrap();
        let owner = store.ensure_owner("ihsan", "İhsan").await.unwrap();
        assert_eq!(owner.role, "owner");
    }

    #[tokio::test]
    async fn channel_link_resolution() {
        let store = test_store().await;
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        store
            .link_channel(
                "alice",
                "telegram",
                "12345",
                serde_json::json!({"chat_id": 678}),
            )
            .await
            .unwrap();

        let resolved = store.resolve_channel("telegram", "12345").await.unwrap();
        assert_eq!(resolved.as_deref(), Some("alice"));
        assert!(store
            .resolve_channel("telegram", "99999")
            .await
            .unwrap()
            .is_none());

        let link = store
            .get_channel_link("alice", "telegram")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.metadata["chat_id"], 678);
    }

    #[tokio::test]
    async fn link_is_unique_per_channel_address() {
        let store = test_store().await;
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        store
            .get_or_create_user("bob", None, "member")
            .await
            .unwrap();
        store
            .link_channel("alice", "telegram", "111", serde_json::json!({}))
            .await
            .unwrap();
        // Re-linking the same address replaces the owner
        store
            .link_channel("bob", "telegram", "111", serde_json::json!({}))
            .await
            .unwrap();
        let resolved = store.resolve_channel("telegram", "111").await.unwrap();
        assert_eq!(resolved.as_deref(), Some("bob"));
    }
}
