//! Session lifecycle — open, rotate bookkeeping, idempotent close.

use chrono::Utc;
use graphbot_core::error::StoreError;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::rows::SessionRow;
use crate::store::{column, opt_ts_column, ts_column, Store};

impl Store {
    /// Get the open session for `(user, channel)`, creating one lazily.
    /// Preserves the invariant of at most one open session per pair.
    pub async fn open_session(
        &self,
        user_id: &str,
        channel: &str,
    ) -> Result<SessionRow, StoreError> {
        if let Some(session) = self.get_open_session(user_id, channel).await? {
            return Ok(session);
        }
        let session_id = Uuid::new_v4().to_string();
        // A partial unique index guards the one-open-session invariant;
        // losing the race means another caller just opened one
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sessions (session_id, user_id, channel, started_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(channel)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT session: {e}")))?;
        if result.rows_affected() > 0 {
            info!(%session_id, %user_id, %channel, "Session created");
        }

        self.get_open_session(user_id, channel)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "session",
                id: session_id,
            })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT session: {e}")))?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// The open session for `(user, channel)`, if any.
    pub async fn get_open_session(
        &self,
        user_id: &str,
        channel: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sessions
             WHERE user_id = ?1 AND channel = ?2 AND ended_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT open session: {e}")))?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Any open session for the user, regardless of channel. Used for the
    /// guest single-session cap.
    pub async fn get_any_open_session(
        &self,
        user_id: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sessions
             WHERE user_id = ?1 AND ended_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT any open session: {e}")))?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Close a session. Idempotent: a conditional update guarantees at most
    /// one close wins under concurrent callers. Returns `true` for the call
    /// that actually closed the row.
    pub async fn end_session(
        &self,
        session_id: &str,
        summary: &str,
        close_reason: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions
             SET ended_at = ?1, summary = ?2, close_reason = ?3
             WHERE session_id = ?4 AND ended_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(summary)
        .bind(close_reason)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE end_session: {e}")))?;

        let closed = result.rows_affected() > 0;
        if closed {
            info!(%session_id, %close_reason, "Session ended");
        }
        Ok(closed)
    }

    /// Overwrite the session's token counter with the provider-reported
    /// running total.
    pub async fn update_session_tokens(
        &self,
        session_id: &str,
        token_count: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET token_count = ?1 WHERE session_id = ?2")
            .bind(token_count)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE token_count: {e}")))?;
        Ok(())
    }

    /// The most recent closed session's summary for a user, if any.
    /// Feeds the context builder's session_summary layer.
    pub async fn last_session_summary(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT summary FROM sessions
             WHERE user_id = ?1 AND ended_at IS NOT NULL AND summary IS NOT NULL
             ORDER BY ended_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT last summary: {e}")))?;
        Ok(row.and_then(|r| r.try_get("summary").ok()))
    }

    /// Recent sessions for a user, newest first.
    pub async fn user_sessions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT user sessions: {e}")))?;
        rows.iter().map(session_from_row).collect()
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        session_id: column(row, "session_id")?,
        user_id: column(row, "user_id")?,
        channel: column(row, "channel")?,
        started_at: ts_column(row, "started_at")?,
        ended_at: opt_ts_column(row, "ended_at")?,
        summary: column(row, "summary")?,
        token_count: column(row, "token_count")?,
        close_reason: column(row, "close_reason")?,
    })
}
