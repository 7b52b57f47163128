//! The system event queue — at-least-once delivery of background results.
//!
//! Producers enqueue; consumers (realtime push or the context builder's
//! events layer) read undelivered rows and mark them delivered by id.
//! Marking is an idempotent UPDATE, so duplicate delivery paths collapse.

use chrono::Utc;
use graphbot_core::error::StoreError;
use graphbot_core::event::SystemEvent;

use crate::store::{column, json_column, ts_column, Store};

impl Store {
    /// Enqueue an event for a user. Returns the stored event.
    pub async fn enqueue_event(
        &self,
        user_id: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<SystemEvent, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO system_events (user_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(kind)
        .bind(payload.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT system_event: {e}")))?;

        Ok(SystemEvent {
            event_id: result.last_insert_rowid(),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            created_at,
        })
    }

    /// Undelivered events for a user, oldest first.
    pub async fn undelivered_events(
        &self,
        user_id: &str,
    ) -> Result<Vec<SystemEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM system_events
             WHERE user_id = ?1 AND delivered_at IS NULL
             ORDER BY event_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT undelivered events: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(SystemEvent {
                    event_id: column(r, "event_id")?,
                    user_id: column(r, "user_id")?,
                    kind: column(r, "kind")?,
                    payload: json_column(r, "payload")?,
                    created_at: ts_column(r, "created_at")?,
                })
            })
            .collect()
    }

    /// Mark events delivered by id. Idempotent — already-delivered rows
    /// keep their original timestamp.
    pub async fn mark_events_delivered(&self, event_ids: &[i64]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for event_id in event_ids {
            sqlx::query(
                "UPDATE system_events SET delivered_at = ?1
                 WHERE event_id = ?2 AND delivered_at IS NULL",
            )
            .bind(&now)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE event delivered: {e}")))?;
        }
        Ok(())
    }
}
