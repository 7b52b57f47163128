//! Scheduler persistence: cron jobs, reminders, background tasks,
//! execution log, and audit rows. The scheduler rehydrates enabled rows at
//! startup; these tables are the source of truth for every trigger.

use chrono::{DateTime, Utc};
use graphbot_core::error::StoreError;
use sqlx::Row;
use tracing::info;

use crate::rows::{
    reminder_status, task_status, BackgroundTaskRow, CronExecutionRow, CronJobRow,
    DelegationLogRow, ReminderRow,
};
use crate::store::{column, opt_json_column, opt_ts_column, ts_column, Store};

impl Store {
    // ── Cron jobs ─────────────────────────────────────────────────────────

    pub async fn add_cron_job(&self, job: &CronJobRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cron_jobs
             (job_id, user_id, cron_expr, message, channel, enabled, processor,
              plan_json, notify_condition, consecutive_failures, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&job.job_id)
        .bind(&job.user_id)
        .bind(&job.cron_expr)
        .bind(&job.message)
        .bind(&job.channel)
        .bind(job.enabled)
        .bind(&job.processor)
        .bind(job.plan_json.as_ref().map(|v| v.to_string()))
        .bind(&job.notify_condition)
        .bind(job.consecutive_failures)
        .bind(job.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT cron_job: {e}")))?;
        Ok(())
    }

    pub async fn get_cron_job(&self, job_id: &str) -> Result<Option<CronJobRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT cron_job: {e}")))?;
        row.map(|r| cron_job_from_row(&r)).transpose()
    }

    /// All cron jobs, optionally filtered by user.
    pub async fn cron_jobs(&self, user_id: Option<&str>) -> Result<Vec<CronJobRow>, StoreError> {
        let rows = match user_id {
            Some(uid) => sqlx::query("SELECT * FROM cron_jobs WHERE user_id = ?1 ORDER BY created_at")
                .bind(uid)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM cron_jobs ORDER BY created_at")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::QueryFailed(format!("SELECT cron_jobs: {e}")))?;
        rows.iter().map(cron_job_from_row).collect()
    }

    pub async fn remove_cron_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cron_jobs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE cron_job: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_job_enabled(&self, job_id: &str, enabled: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE cron_jobs SET enabled = ?1 WHERE job_id = ?2")
            .bind(enabled)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE enabled: {e}")))?;
        Ok(())
    }

    /// Bump the consecutive failure counter. Returns the new count.
    pub async fn increment_failures(&self, job_id: &str) -> Result<i64, StoreError> {
        sqlx::query(
            "UPDATE cron_jobs SET consecutive_failures = consecutive_failures + 1
             WHERE job_id = ?1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE failures: {e}")))?;

        let row = sqlx::query("SELECT consecutive_failures FROM cron_jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT failures: {e}")))?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>("consecutive_failures").ok())
            .unwrap_or(0))
    }

    pub async fn reset_failures(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE cron_jobs SET consecutive_failures = 0 WHERE job_id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE reset failures: {e}")))?;
        Ok(())
    }

    // ── Execution log ─────────────────────────────────────────────────────

    pub async fn log_cron_execution(
        &self,
        job_id: &str,
        status: &str,
        result: Option<&str>,
        duration_ms: i64,
    ) -> Result<i64, StoreError> {
        let res = sqlx::query(
            "INSERT INTO cron_execution_log (job_id, executed_at, status, result, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(job_id)
        .bind(Utc::now().to_rfc3339())
        .bind(status)
        .bind(result)
        .bind(duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT execution log: {e}")))?;
        Ok(res.last_insert_rowid())
    }

    /// Most recent executions for a job, newest first.
    pub async fn cron_executions(
        &self,
        job_id: &str,
        limit: i64,
    ) -> Result<Vec<CronExecutionRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM cron_execution_log WHERE job_id = ?1
             ORDER BY log_id DESC LIMIT ?2",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT execution log: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(CronExecutionRow {
                    log_id: column(r, "log_id")?,
                    job_id: column(r, "job_id")?,
                    executed_at: ts_column(r, "executed_at")?,
                    status: column(r, "status")?,
                    result: column(r, "result")?,
                    duration_ms: column(r, "duration_ms")?,
                })
            })
            .collect()
    }

    // ── Reminders ─────────────────────────────────────────────────────────

    pub async fn add_reminder(&self, reminder: &ReminderRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reminders
             (reminder_id, user_id, channel, run_at, cron_expr, message, processor,
              plan_json, status, created_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&reminder.reminder_id)
        .bind(&reminder.user_id)
        .bind(&reminder.channel)
        .bind(reminder.run_at.to_rfc3339())
        .bind(&reminder.cron_expr)
        .bind(&reminder.message)
        .bind(&reminder.processor)
        .bind(reminder.plan_json.as_ref().map(|v| v.to_string()))
        .bind(&reminder.status)
        .bind(reminder.created_at.to_rfc3339())
        .bind(reminder.sent_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT reminder: {e}")))?;
        Ok(())
    }

    pub async fn get_reminder(
        &self,
        reminder_id: &str,
    ) -> Result<Option<ReminderRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM reminders WHERE reminder_id = ?1")
            .bind(reminder_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT reminder: {e}")))?;
        row.map(|r| reminder_from_row(&r)).transpose()
    }

    /// Pending reminders, optionally filtered by user, soonest first.
    pub async fn pending_reminders(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReminderRow>, StoreError> {
        let rows = match user_id {
            Some(uid) => sqlx::query(
                "SELECT * FROM reminders WHERE status = 'pending' AND user_id = ?1
                 ORDER BY run_at",
            )
            .bind(uid)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query("SELECT * FROM reminders WHERE status = 'pending' ORDER BY run_at")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::QueryFailed(format!("SELECT pending reminders: {e}")))?;
        rows.iter().map(reminder_from_row).collect()
    }

    /// pending → sent. One-shot only; recurring reminders stay pending.
    pub async fn mark_reminder_sent(&self, reminder_id: &str) -> Result<(), StoreError> {
        self.set_reminder_status(reminder_id, reminder_status::SENT, true)
            .await
    }

    /// pending → failed. Not retried.
    pub async fn mark_reminder_failed(&self, reminder_id: &str) -> Result<(), StoreError> {
        self.set_reminder_status(reminder_id, reminder_status::FAILED, false)
            .await
    }

    /// pending → cancelled. Returns true if a pending row was cancelled.
    pub async fn cancel_reminder(&self, reminder_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reminders SET status = 'cancelled'
             WHERE reminder_id = ?1 AND status = 'pending'",
        )
        .bind(reminder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE cancel reminder: {e}")))?;
        let cancelled = result.rows_affected() > 0;
        if cancelled {
            info!(%reminder_id, "Reminder cancelled");
        }
        Ok(cancelled)
    }

    async fn set_reminder_status(
        &self,
        reminder_id: &str,
        status: &str,
        stamp_sent: bool,
    ) -> Result<(), StoreError> {
        let sent_at = stamp_sent.then(|| Utc::now().to_rfc3339());
        sqlx::query("UPDATE reminders SET status = ?1, sent_at = ?2 WHERE reminder_id = ?3")
            .bind(status)
            .bind(sent_at)
            .bind(reminder_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE reminder status: {e}")))?;
        Ok(())
    }

    // ── Background tasks ──────────────────────────────────────────────────

    pub async fn create_background_task(
        &self,
        task: &BackgroundTaskRow,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO background_tasks
             (task_id, user_id, parent_session, fallback_channel, status, plan, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&task.task_id)
        .bind(&task.user_id)
        .bind(&task.parent_session)
        .bind(&task.fallback_channel)
        .bind(&task.status)
        .bind(task.plan.to_string())
        .bind(task.started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT background_task: {e}")))?;
        Ok(())
    }

    pub async fn complete_background_task(
        &self,
        task_id: &str,
        result: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE background_tasks SET status = ?1, result = ?2, completed_at = ?3
             WHERE task_id = ?4",
        )
        .bind(task_status::COMPLETED)
        .bind(result)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE complete task: {e}")))?;
        Ok(())
    }

    pub async fn fail_background_task(
        &self,
        task_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE background_tasks SET status = ?1, error = ?2, completed_at = ?3
             WHERE task_id = ?4",
        )
        .bind(task_status::FAILED)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE fail task: {e}")))?;
        Ok(())
    }

    pub async fn get_background_task(
        &self,
        task_id: &str,
    ) -> Result<Option<BackgroundTaskRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM background_tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT background_task: {e}")))?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    // ── Audit rows ────────────────────────────────────────────────────────

    pub async fn log_delegation(
        &self,
        user_id: &str,
        task: &str,
        plan_json: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO delegation_logs (user_id, task, plan_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(task)
        .bind(plan_json.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT delegation_log: {e}")))?;
        Ok(())
    }

    pub async fn delegation_logs(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<DelegationLogRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM delegation_logs WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT delegation_logs: {e}")))?;
        rows.iter()
            .map(|r| {
                Ok(DelegationLogRow {
                    id: column(r, "id")?,
                    user_id: column(r, "user_id")?,
                    task: column(r, "task")?,
                    plan_json: crate::store::json_column(r, "plan_json")?,
                    created_at: ts_column(r, "created_at")?,
                })
            })
            .collect()
    }

    pub async fn record_api_key(
        &self,
        key_id: &str,
        user_id: &str,
        key_hash: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_keys (key_id, user_id, key_hash, label, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(key_id)
        .bind(user_id)
        .bind(key_hash)
        .bind(label)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT api_key: {e}")))?;
        Ok(())
    }

    pub async fn touch_api_key(&self, key_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE api_key: {e}")))?;
        Ok(())
    }
}

fn cron_job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CronJobRow, StoreError> {
    Ok(CronJobRow {
        job_id: column(row, "job_id")?,
        user_id: column(row, "user_id")?,
        cron_expr: column(row, "cron_expr")?,
        message: column(row, "message")?,
        channel: column(row, "channel")?,
        enabled: column::<i64>(row, "enabled")? != 0,
        processor: column(row, "processor")?,
        plan_json: opt_json_column(row, "plan_json")?,
        notify_condition: column(row, "notify_condition")?,
        consecutive_failures: column(row, "consecutive_failures")?,
        created_at: ts_column(row, "created_at")?,
    })
}

fn reminder_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ReminderRow, StoreError> {
    Ok(ReminderRow {
        reminder_id: column(row, "reminder_id")?,
        user_id: column(row, "user_id")?,
        channel: column(row, "channel")?,
        run_at: ts_column(row, "run_at")?,
        cron_expr: column(row, "cron_expr")?,
        message: column(row, "message")?,
        processor: column(row, "processor")?,
        plan_json: opt_json_column(row, "plan_json")?,
        status: column(row, "status")?,
        created_at: ts_column(row, "created_at")?,
        sent_at: opt_ts_column(row, "sent_at")?,
    })
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BackgroundTaskRow, StoreError> {
    Ok(BackgroundTaskRow {
        task_id: column(row, "task_id")?,
        user_id: column(row, "user_id")?,
        parent_session: column(row, "parent_session")?,
        fallback_channel: column(row, "fallback_channel")?,
        status: column(row, "status")?,
        plan: crate::store::json_column(row, "plan")?,
        result: column(row, "result")?,
        error: column(row, "error")?,
        started_at: ts_column(row, "started_at")?,
        completed_at: opt_ts_column(row, "completed_at")?,
    })
}

/// Build a new pending reminder row due `delay_seconds` from now.
pub fn new_reminder(
    reminder_id: String,
    user_id: String,
    channel: String,
    run_at: DateTime<Utc>,
    cron_expr: Option<String>,
    message: String,
    processor: String,
    plan_json: Option<serde_json::Value>,
) -> ReminderRow {
    ReminderRow {
        reminder_id,
        user_id,
        channel,
        run_at,
        cron_expr,
        message,
        processor,
        plan_json,
        status: reminder_status::PENDING.to_string(),
        created_at: Utc::now(),
        sent_at: None,
    }
}
