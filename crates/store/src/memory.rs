//! Semantic key-value and list stores: agent memory, notes, activity,
//! favorites, preferences. Consumed by the context builder, mutated by
//! tools and session rotation.

use chrono::{Duration, Utc};
use graphbot_core::error::StoreError;
use sqlx::Row;

use crate::rows::{ActivityRow, AgentMemoryRow, FavoriteRow, NoteRow};
use crate::store::{column, json_column, ts_column, Store};

impl Store {
    // ── Agent memory ──────────────────────────────────────────────────────

    /// Write or update an agent memory entry. Empty `user_id` is the
    /// agent's own (global) memory.
    pub async fn write_memory(
        &self,
        user_id: &str,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_memory (user_id, key, content, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, key) DO UPDATE SET
                 content = excluded.content,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT agent_memory: {e}")))?;
        Ok(())
    }

    pub async fn read_memory(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT content FROM agent_memory WHERE user_id = ?1 AND key = ?2")
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT agent_memory: {e}")))?;
        Ok(row.and_then(|r| r.try_get("content").ok()))
    }

    pub async fn all_memory(&self, user_id: &str) -> Result<Vec<AgentMemoryRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agent_memory WHERE user_id = ?1 ORDER BY key")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT all memory: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(AgentMemoryRow {
                    user_id: column(r, "user_id")?,
                    key: column(r, "key")?,
                    content: column(r, "content")?,
                    updated_at: ts_column(r, "updated_at")?,
                })
            })
            .collect()
    }

    // ── Notes ─────────────────────────────────────────────────────────────

    /// Add a learned fact. `source` tags where it came from:
    /// "conversation", "extraction", or "onboarding".
    pub async fn add_note(
        &self,
        user_id: &str,
        note: &str,
        source: &str,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO user_notes (user_id, note, source, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(note)
        .bind(source)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT note: {e}")))?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent notes first.
    pub async fn notes(&self, user_id: &str, limit: i64) -> Result<Vec<NoteRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM user_notes WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT notes: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(NoteRow {
                    id: column(r, "id")?,
                    user_id: column(r, "user_id")?,
                    note: column(r, "note")?,
                    source: column(r, "source")?,
                    created_at: ts_column(r, "created_at")?,
                })
            })
            .collect()
    }

    // ── Activity log ──────────────────────────────────────────────────────

    pub async fn log_activity(
        &self,
        user_id: &str,
        item_title: &str,
        activity_type: &str,
        item_id: Option<&str>,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO activity_logs
             (user_id, item_id, item_title, activity_type, activity_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(item_title)
        .bind(activity_type)
        .bind(now.date_naive().to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT activity: {e}")))?;
        Ok(result.last_insert_rowid())
    }

    /// Activities within the last `days` days, newest first.
    pub async fn recent_activities(
        &self,
        user_id: &str,
        days: i64,
    ) -> Result<Vec<ActivityRow>, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).date_naive().to_string();
        let rows = sqlx::query(
            "SELECT * FROM activity_logs
             WHERE user_id = ?1 AND activity_date >= ?2
             ORDER BY activity_date DESC, id DESC",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT activities: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(ActivityRow {
                    id: column(r, "id")?,
                    user_id: column(r, "user_id")?,
                    item_id: column(r, "item_id")?,
                    item_title: column(r, "item_title")?,
                    activity_type: column(r, "activity_type")?,
                    activity_date: column(r, "activity_date")?,
                    created_at: ts_column(r, "created_at")?,
                })
            })
            .collect()
    }

    // ── Favorites ─────────────────────────────────────────────────────────

    pub async fn add_favorite(
        &self,
        user_id: &str,
        item_id: &str,
        item_title: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO favorites (user_id, item_id, item_title, added_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(item_title)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT favorite: {e}")))?;
        Ok(())
    }

    pub async fn remove_favorite(&self, user_id: &str, item_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM favorites WHERE user_id = ?1 AND item_id = ?2")
            .bind(user_id)
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE favorite: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn favorites(&self, user_id: &str) -> Result<Vec<FavoriteRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM favorites WHERE user_id = ?1 ORDER BY added_at DESC, item_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT favorites: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(FavoriteRow {
                    user_id: column(r, "user_id")?,
                    item_id: column(r, "item_id")?,
                    item_title: column(r, "item_title")?,
                    added_at: ts_column(r, "added_at")?,
                })
            })
            .collect()
    }

    // ── Preferences ───────────────────────────────────────────────────────

    /// The user's preference document. Empty object if none.
    pub async fn preferences(&self, user_id: &str) -> Result<serde_json::Value, StoreError> {
        let row = sqlx::query("SELECT data FROM preferences WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT preferences: {e}")))?;
        match row {
            Some(r) => json_column(&r, "data"),
            None => Ok(serde_json::json!({})),
        }
    }

    /// JSON-merge `data` into the user's preference document. New keys win.
    pub async fn merge_preferences(
        &self,
        user_id: &str,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut current = self.preferences(user_id).await?;
        if let (Some(cur), Some(new)) = (current.as_object_mut(), data.as_object()) {
            for (k, v) in new {
                cur.insert(k.clone(), v.clone());
            }
        }
        sqlx::query(
            "INSERT INTO preferences (user_id, data, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 data = excluded.data,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(current.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT preferences: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> Store {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn agent_memory_upserts() {
        let store = store_with_user().await;
        store.write_memory("", "long_term", "v1").await.unwrap();
        store.write_memory("", "long_term", "v2").await.unwrap();
        assert_eq!(
            store.read_memory("", "long_term").await.unwrap().as_deref(),
            Some("v2")
        );
        assert!(store.read_memory("", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notes_newest_first_with_source() {
        let store = store_with_user().await;
        store
            .add_note("alice", "likes tea", "conversation")
            .await
            .unwrap();
        store
            .add_note("alice", "works at Acme", "extraction")
            .await
            .unwrap();

        let notes = store.notes("alice", 10).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "works at Acme");
        assert_eq!(notes[0].source, "extraction");
    }

    #[tokio::test]
    async fn activity_window_filters_by_date() {
        let store = store_with_user().await;
        store
            .log_activity("alice", "Morning run", "logged", None)
            .await
            .unwrap();
        let recent = store.recent_activities("alice", 7).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].item_title, "Morning run");
    }

    #[tokio::test]
    async fn favorites_add_remove() {
        let store = store_with_user().await;
        store
            .add_favorite("alice", "item_1", "Kadıköy börekçisi")
            .await
            .unwrap();
        assert_eq!(store.favorites("alice").await.unwrap().len(), 1);
        assert!(store.remove_favorite("alice", "item_1").await.unwrap());
        assert!(!store.remove_favorite("alice", "item_1").await.unwrap());
        assert!(store.favorites("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preferences_merge_as_json_documents() {
        let store = store_with_user().await;
        store
            .merge_preferences("alice", &serde_json::json!({"language": "tr"}))
            .await
            .unwrap();
        store
            .merge_preferences(
                "alice",
                &serde_json::json!({"style": "short", "language": "en"}),
            )
            .await
            .unwrap();

        let prefs = store.preferences("alice").await.unwrap();
        assert_eq!(prefs["language"], "en"); // newest value wins
        assert_eq!(prefs["style"], "short");
    }

    #[tokio::test]
    async fn empty_preferences_is_empty_object() {
        let store = store_with_user().await;
        let prefs = store.preferences("alice").await.unwrap();
        assert_eq!(prefs, serde_json::json!({}));
    }
}
