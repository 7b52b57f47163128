//! Scheduling tools — reminders and cron jobs through the scheduler
//! handle. These live in the `scheduling` group and are never handed to
//! background agents.

use async_trait::async_trait;

use graphbot_core::error::ToolError;
use graphbot_core::plan::{Execution, ExecutionPlan, NotifyCondition, ProcessorSpec};
use graphbot_core::tool::Tool;
use graphbot_scheduler::SchedulerHandle;

fn required<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' is required")))
}

fn scheduler_err(tool: &str, e: graphbot_core::error::Error) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool.into(),
        reason: e.to_string(),
    }
}

fn static_plan(execution: Execution, message: &str, extra: PlanTiming) -> ExecutionPlan {
    ExecutionPlan {
        execution,
        delay_seconds: extra.delay_seconds,
        cron_expr: extra.cron_expr,
        notify_condition: NotifyCondition::Always,
        channel: None,
        processor: ProcessorSpec::Static {
            message: message.to_string(),
        },
    }
}

#[derive(Default)]
struct PlanTiming {
    delay_seconds: Option<u64>,
    cron_expr: Option<String>,
}

/// Set a one-shot reminder after a delay.
pub struct CreateReminderTool {
    scheduler: SchedulerHandle,
}

impl CreateReminderTool {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CreateReminderTool {
    fn name(&self) -> &str {
        "create_reminder"
    }

    fn description(&self) -> &str {
        "Set a one-shot reminder: deliver a message to the user after a delay."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "delay_seconds": {"type": "integer", "minimum": 1},
                "message": {"type": "string", "description": "Text delivered at trigger time"},
                "channel": {"type": "string", "description": "Auto-filled from the session when omitted"}
            },
            "required": ["user_id", "delay_seconds", "message"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let message = required(&args, "message")?;
        let delay = args["delay_seconds"]
            .as_u64()
            .ok_or_else(|| ToolError::InvalidArguments("'delay_seconds' is required".into()))?;
        let channel = args["channel"].as_str().unwrap_or("api");

        let plan = static_plan(
            Execution::Delayed,
            message,
            PlanTiming {
                delay_seconds: Some(delay),
                ..Default::default()
            },
        );
        let reminder_id = self
            .scheduler
            .add_reminder(user_id, Some(delay), None, message, plan, channel)
            .await
            .map_err(|e| scheduler_err("create_reminder", e))?;
        Ok(format!("Reminder {reminder_id} set for {delay} seconds from now."))
    }
}

/// Cancel a pending reminder.
pub struct CancelReminderTool {
    scheduler: SchedulerHandle,
}

impl CancelReminderTool {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CancelReminderTool {
    fn name(&self) -> &str {
        "cancel_reminder"
    }

    fn description(&self) -> &str {
        "Cancel a pending reminder by id."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "reminder_id": {"type": "string"} },
            "required": ["reminder_id"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let reminder_id = required(&args, "reminder_id")?;
        let cancelled = self
            .scheduler
            .cancel_reminder(reminder_id)
            .await
            .map_err(|e| scheduler_err("cancel_reminder", e))?;
        Ok(if cancelled {
            format!("Reminder {reminder_id} cancelled.")
        } else {
            format!("No pending reminder with id {reminder_id}.")
        })
    }
}

/// List the user's pending reminders.
pub struct ListRemindersTool {
    scheduler: SchedulerHandle,
}

impl ListRemindersTool {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for ListRemindersTool {
    fn name(&self) -> &str {
        "list_reminders"
    }

    fn description(&self) -> &str {
        "List the user's pending reminders."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "user_id": {"type": "string"} },
            "required": ["user_id"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let reminders = self
            .scheduler
            .list_reminders(Some(user_id))
            .await
            .map_err(|e| scheduler_err("list_reminders", e))?;
        if reminders.is_empty() {
            return Ok("No pending reminders.".into());
        }
        let lines: Vec<String> = reminders
            .iter()
            .map(|r| match &r.cron_expr {
                Some(expr) => format!("- {} (recurring {expr}): {}", r.reminder_id, r.message),
                None => format!("- {} at {}: {}", r.reminder_id, r.run_at, r.message),
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Create a recurring cron job delivering a fixed message.
pub struct CreateCronJobTool {
    scheduler: SchedulerHandle,
}

impl CreateCronJobTool {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CreateCronJobTool {
    fn name(&self) -> &str {
        "create_cron_job"
    }

    fn description(&self) -> &str {
        "Create a recurring job on a cron schedule that delivers a fixed message."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "cron_expr": {
                    "type": "string",
                    "description": "5-field cron expression, e.g. \"0 9 * * 1-5\""
                },
                "message": {"type": "string"},
                "channel": {"type": "string", "description": "Auto-filled from the session when omitted"}
            },
            "required": ["user_id", "cron_expr", "message"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let cron_expr = required(&args, "cron_expr")?;
        let message = required(&args, "message")?;
        let channel = args["channel"].as_str().unwrap_or("api");

        let plan = static_plan(
            Execution::Recurring,
            message,
            PlanTiming {
                cron_expr: Some(cron_expr.to_string()),
                ..Default::default()
            },
        );
        let job_id = self
            .scheduler
            .add_job(user_id, cron_expr, message, plan, channel)
            .await
            .map_err(|e| scheduler_err("create_cron_job", e))?;
        Ok(format!("Cron job {job_id} created ({cron_expr})."))
    }
}

/// Remove a cron job.
pub struct RemoveCronJobTool {
    scheduler: SchedulerHandle,
}

impl RemoveCronJobTool {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for RemoveCronJobTool {
    fn name(&self) -> &str {
        "remove_cron_job"
    }

    fn description(&self) -> &str {
        "Delete a cron job by id."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "job_id": {"type": "string"} },
            "required": ["job_id"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let job_id = required(&args, "job_id")?;
        let removed = self
            .scheduler
            .cancel_job(job_id)
            .await
            .map_err(|e| scheduler_err("remove_cron_job", e))?;
        Ok(if removed {
            format!("Cron job {job_id} removed.")
        } else {
            format!("No cron job with id {job_id}.")
        })
    }
}
