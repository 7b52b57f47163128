//! The delegate tool — the main agent's entry point into background
//! execution.
//!
//! One call plans the task (structured-output LLM call) and routes the
//! typed plan: immediate plans go to the subagent worker, delayed plans
//! become reminders, recurring and monitor plans become cron jobs. A plan
//! the planner cannot produce is a fatal tool error — the main agent sees
//! a "planning failed" result and can apologize or rephrase.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use graphbot_agent::DelegationPlanner;
use graphbot_core::error::ToolError;
use graphbot_core::plan::Execution;
use graphbot_core::tool::Tool;
use graphbot_scheduler::{SchedulerHandle, SubagentWorker};
use graphbot_store::Store;

/// Delegate a task to a background agent.
pub struct DelegateTool {
    planner: Arc<DelegationPlanner>,
    worker: Arc<SubagentWorker>,
    scheduler: SchedulerHandle,
    store: Store,
}

impl DelegateTool {
    pub fn new(
        planner: Arc<DelegationPlanner>,
        worker: Arc<SubagentWorker>,
        scheduler: SchedulerHandle,
        store: Store,
    ) -> Self {
        Self {
            planner,
            worker,
            scheduler,
            store,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a task to a background agent.\n\
         A planner decides when the task runs (now, later, on a schedule, \
         or as a monitor) and how (plain message, direct tool call, or an \
         isolated agent). Just describe the task clearly, including any \
         timing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string", "description": "User who requested the task"},
                "task": {"type": "string", "description": "Full task description with timing"},
                "channel": {
                    "type": "string",
                    "description": "Delivery channel (auto-filled from the session when omitted)"
                }
            },
            "required": ["user_id", "task"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = args["user_id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("'user_id' is required".into()))?;
        let task = args["task"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("'task' is required".into()))?;
        let session_channel = args["channel"].as_str().unwrap_or("api");

        let plan = self.planner.plan(task).await.map_err(|e| {
            warn!(error = %e, "Delegation planning failed");
            ToolError::ExecutionFailed {
                tool_name: "delegate".into(),
                reason: format!("planning failed: {e}"),
            }
        })?;

        // Audit row: which task produced which plan
        if let Ok(plan_json) = serde_json::to_value(&plan) {
            if let Err(e) = self.store.log_delegation(user_id, task, &plan_json).await {
                warn!(error = %e, "Failed to write delegation log");
            }
        }

        let channel = plan
            .channel
            .clone()
            .unwrap_or_else(|| session_channel.to_string());
        info!(
            %user_id,
            execution = ?plan.execution,
            processor = plan.processor.kind(),
            %channel,
            "Task delegated"
        );

        let wrap = |e: graphbot_core::error::Error| ToolError::ExecutionFailed {
            tool_name: "delegate".into(),
            reason: e.to_string(),
        };

        match plan.execution {
            Execution::Immediate => {
                let task_id = self
                    .worker
                    .spawn(user_id, None, plan, task, &channel)
                    .await
                    .map_err(wrap)?;
                Ok(format!("Task delegated: {task_id}"))
            }
            Execution::Delayed => {
                let delay = plan.delay_seconds;
                let reminder_id = self
                    .scheduler
                    .add_reminder(user_id, delay, None, task, plan, &channel)
                    .await
                    .map_err(wrap)?;
                Ok(format!(
                    "Scheduled: {reminder_id} (runs in {} seconds)",
                    delay.unwrap_or(0)
                ))
            }
            Execution::Recurring | Execution::Monitor => {
                let cron_expr = plan.cron_expr.clone().unwrap_or_default();
                let job_id = self
                    .scheduler
                    .add_job(user_id, &cron_expr, task, plan, &channel)
                    .await
                    .map_err(wrap)?;
                Ok(format!("Scheduled job created: {job_id} ({cron_expr})"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphbot_core::channel::test_support::RecordingPort;
    use graphbot_core::error::ProviderError;
    use graphbot_core::event::EventBus;
    use graphbot_core::message::Message;
    use graphbot_core::provider::{
        ChatRequest, ChatResponse, ExtractedFacts, Provider, Usage,
    };
    use graphbot_core::tool::ToolRegistry;
    use graphbot_scheduler::{Dispatcher, Scheduler};

    /// Provider whose structured output is fixed; plain chat echoes.
    struct PlannerStub(serde_json::Value);

    #[async_trait]
    impl Provider for PlannerStub {
        fn name(&self) -> &str {
            "planner-stub"
        }
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                message: Message::assistant("background result"),
                usage: Usage::default(),
                model: "stub".into(),
            })
        }
        async fn chat_structured(
            &self,
            _m: Vec<Message>,
            _s: serde_json::Value,
            _model: &str,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(self.0.clone())
        }
        async fn summarize(&self, _m: &[Message], _model: &str) -> String {
            String::new()
        }
        async fn extract_facts(&self, _m: &[Message], _model: &str) -> ExtractedFacts {
            ExtractedFacts::default()
        }
    }

    async fn delegate_with(planner_output: serde_json::Value) -> (DelegateTool, Store) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let provider: Arc<dyn Provider> = Arc::new(PlannerStub(planner_output));
        let port = Arc::new(RecordingPort::default());
        let bus = Arc::new(EventBus::default());
        let background = Arc::new(ToolRegistry::new().background_subregistry());
        let dispatcher = Arc::new(Dispatcher::new(
            provider.clone(),
            background.clone(),
            port,
            store.clone(),
            bus.clone(),
            "default-model",
            300,
        ));
        let (handle, _task) = Scheduler::new(store.clone(), dispatcher.clone()).spawn();
        let worker = Arc::new(SubagentWorker::new(store.clone(), dispatcher, bus));
        let planner = Arc::new(DelegationPlanner::new(
            provider,
            "openai/gpt-4o-mini",
            &background,
            &[],
        ));
        (
            DelegateTool::new(planner, worker, handle, store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn delayed_plan_creates_reminder() {
        let (tool, store) = delegate_with(serde_json::json!({
            "execution": "delayed",
            "processor": "static",
            "delay_seconds": 7200,
            "message": "Toplantı hatırlatma!",
        }))
        .await;

        let result = tool
            .execute(serde_json::json!({
                "user_id": "alice",
                "task": "2 saat sonra toplantım var hatırlat",
                "channel": "telegram"
            }))
            .await
            .unwrap();
        assert!(result.contains("7200 seconds"));

        let reminders = store.pending_reminders(Some("alice")).await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].channel, "telegram");
        assert_eq!(reminders[0].processor, "static");

        let logs = store.delegation_logs("alice", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].plan_json["processor"], "static");
    }

    #[tokio::test]
    async fn monitor_plan_creates_cron_job() {
        let (tool, store) = delegate_with(serde_json::json!({
            "execution": "monitor",
            "processor": "agent",
            "cron_expr": "*/30 * * * *",
            "prompt": "Check gold price; [SKIP] below 3000.",
            "tools": [],
        }))
        .await;

        tool.execute(serde_json::json!({
            "user_id": "alice",
            "task": "Altın 3000 TL'yi geçerse haber ver",
            "channel": "telegram"
        }))
        .await
        .unwrap();

        let jobs = store.cron_jobs(Some("alice")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].cron_expr, "*/30 * * * *");
        assert_eq!(jobs[0].notify_condition, "notify_skip");
    }

    #[tokio::test]
    async fn immediate_plan_spawns_worker_task() {
        let (tool, store) = delegate_with(serde_json::json!({
            "execution": "immediate",
            "processor": "agent",
            "prompt": "Research the topic and send the result.",
            "tools": [],
        }))
        .await;

        let result = tool
            .execute(serde_json::json!({
                "user_id": "alice",
                "task": "research rust agents",
                "channel": "api"
            }))
            .await
            .unwrap();
        assert!(result.contains("Task delegated"));

        // Row exists immediately with some status
        let task_id = result.split(": ").nth(1).unwrap().trim();
        assert!(store.get_background_task(task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn planning_failure_is_a_tool_error() {
        // Planner returns an invalid plan (static without message)
        let (tool, store) = delegate_with(serde_json::json!({
            "execution": "delayed",
            "processor": "static",
            "delay_seconds": 60,
        }))
        .await;

        let err = tool
            .execute(serde_json::json!({"user_id": "alice", "task": "do a thing"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("planning failed"));
        assert!(store.pending_reminders(Some("alice")).await.unwrap().is_empty());
    }
}
