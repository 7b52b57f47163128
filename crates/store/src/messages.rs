//! Append-only message log. Ordering is by insertion id, not timestamp.

use chrono::Utc;
use graphbot_core::error::StoreError;

use crate::rows::MessageRow;
use crate::store::{column, opt_json_column, ts_column, Store};

impl Store {
    /// Append a message to a session. Returns the insertion id.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&serde_json::Value>,
        tool_call_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (session_id, role, content, tool_calls, tool_call_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(tool_calls.map(|v| v.to_string()))
        .bind(tool_call_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT message: {e}")))?;
        Ok(result.last_insert_rowid())
    }

    /// The last `limit` messages of a session, in insertion order.
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT * FROM messages WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT recent messages: {e}")))?;
        rows.iter().map(message_from_row).collect()
    }

    /// All messages of a session, in insertion order.
    pub async fn session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ?1 ORDER BY id ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT session messages: {e}")))?;
        rows.iter().map(message_from_row).collect()
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MessageRow, StoreError> {
    Ok(MessageRow {
        id: column(row, "id")?,
        session_id: column(row, "session_id")?,
        role: column(row, "role")?,
        content: column(row, "content")?,
        tool_calls: opt_json_column(row, "tool_calls")?,
        tool_call_id: column(row, "tool_call_id")?,
        created_at: ts_column(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> (Store, String) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let session = store.open_session("alice", "api").await.unwrap();
        (store, session.session_id)
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let (store, session) = store_with_session().await;
        for i in 0..5 {
            store
                .append_message(&session, "user", &format!("msg {i}"), None, None)
                .await
                .unwrap();
        }
        let messages = store.session_messages(&session).await.unwrap();
        assert_eq!(messages.len(), 5);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn recent_messages_keeps_tail_in_order() {
        let (store, session) = store_with_session().await;
        for i in 0..10 {
            store
                .append_message(&session, "user", &format!("msg {i}"), None, None)
                .await
                .unwrap();
        }
        let recent = store.recent_messages(&session, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 7", "msg 8", "msg 9"]);
    }

    #[tokio::test]
    async fn tool_calls_roundtrip_as_json() {
        let (store, session) = store_with_session().await;
        let calls = serde_json::json!([
            {"id": "call_1", "name": "web_fetch", "arguments": {"url": "weather:istanbul"}}
        ]);
        store
            .append_message(&session, "assistant", "", Some(&calls), None)
            .await
            .unwrap();
        store
            .append_message(&session, "tool", "sunny, 24°C", None, Some("call_1"))
            .await
            .unwrap();

        let messages = store.session_messages(&session).await.unwrap();
        assert_eq!(messages[0].tool_calls.as_ref().unwrap()[0]["name"], "web_fetch");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn sessions_isolate_messages() {
        let (store, session_a) = store_with_session().await;
        store
            .get_or_create_user("bob", None, "member")
            .await
            .unwrap();
        let session_b = store.open_session("bob", "api").await.unwrap().session_id;

        store
            .append_message(&session_a, "user", "for alice", None, None)
            .await
            .unwrap();
        store
            .append_message(&session_b, "user", "for bob", None, None)
            .await
            .unwrap();

        assert_eq!(store.session_messages(&session_a).await.unwrap().len(), 1);
        assert_eq!(store.session_messages(&session_b).await.unwrap().len(), 1);
    }
}
