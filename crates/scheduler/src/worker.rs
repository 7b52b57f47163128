//! SubagentWorker — immediate fire-and-forget background execution.
//!
//! `spawn` persists a running BackgroundTask row and executes the plan on
//! a detached task using the same processor semantics as the scheduler.
//! Completion writes the result row, enqueues exactly one
//! `subagent_result` event, and — when the parent session is still open —
//! attempts a direct push through the channel port. A push that lands
//! marks the event delivered; otherwise the next session turn picks it up
//! through the context builder's events layer.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use graphbot_core::error::Error;
use graphbot_core::event::{EventBus, KIND_SUBAGENT_RESULT};
use graphbot_core::plan::ExecutionPlan;
use graphbot_store::{task_status, BackgroundTaskRow, Store};

use crate::dispatch::Dispatcher;

/// Spawns and tracks immediate background tasks.
pub struct SubagentWorker {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SubagentWorker {
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            dispatcher,
            bus,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a background task. Returns the task id immediately; the plan
    /// runs detached.
    pub async fn spawn(
        &self,
        user_id: &str,
        parent_session: Option<&str>,
        plan: ExecutionPlan,
        task_text: &str,
        channel: &str,
    ) -> Result<String, Error> {
        let task_id = Uuid::new_v4().to_string()[..8].to_string();
        let row = BackgroundTaskRow {
            task_id: task_id.clone(),
            user_id: user_id.to_string(),
            parent_session: parent_session.map(String::from),
            fallback_channel: channel.to_string(),
            status: task_status::RUNNING.to_string(),
            plan: serde_json::to_value(&plan)?,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.store.create_background_task(&row).await?;
        info!(%task_id, %user_id, task_chars = task_text.len(), "Subagent spawned");

        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let bus = self.bus.clone();
        let tasks = self.tasks.clone();
        let id = task_id.clone();
        let user = user_id.to_string();
        let parent = parent_session.map(String::from);
        let chan = channel.to_string();
        let text = task_text.to_string();

        let handle = tokio::spawn(async move {
            run_task(store, dispatcher, bus, &id, &user, parent.as_deref(), &plan, &text, &chan)
                .await;
            tasks.lock().unwrap().remove(&id);
        });
        self.tasks.lock().unwrap().insert(task_id.clone(), handle);
        Ok(task_id)
    }

    /// Number of currently running tasks.
    pub fn running_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Wait for all running tasks to complete.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Waiting for subagent tasks to finish");
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    store: Store,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    task_id: &str,
    user_id: &str,
    parent_session: Option<&str>,
    plan: &ExecutionPlan,
    task_text: &str,
    channel: &str,
) {
    match dispatcher.run_plan(plan, task_text, channel).await {
        Ok(outcome) => {
            let result = outcome.response.unwrap_or_else(|| "(no output)".into());
            info!(%task_id, chars = result.len(), "Subagent completed");
            if let Err(e) = store.complete_background_task(task_id, &result).await {
                error!(%task_id, error = %e, "Failed to persist task result");
                return;
            }

            let payload = serde_json::json!({ "task_id": task_id, "result": result });
            let event = match store.enqueue_event(user_id, KIND_SUBAGENT_RESULT, &payload).await {
                Ok(event) => event,
                Err(e) => {
                    error!(%task_id, error = %e, "Failed to enqueue result event");
                    return;
                }
            };
            bus.publish(event.clone());

            // Direct push only while the originating session is still open
            let parent_open = match parent_session {
                Some(session_id) => store
                    .get_session(session_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.is_open())
                    .unwrap_or(false),
                None => false,
            };
            if parent_open && dispatcher.port().send(user_id, channel, &result).await.is_ok() {
                let _ = store.mark_events_delivered(&[event.event_id]).await;
                info!(%task_id, %channel, "Result pushed to live session");
            }
        }
        Err(e) => {
            error!(%task_id, error = %e, "Subagent failed");
            let _ = store.fail_background_task(task_id, &e.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graphbot_core::channel::test_support::RecordingPort;
    use graphbot_core::error::ProviderError;
    use graphbot_core::message::Message;
    use graphbot_core::plan::{Execution, NotifyCondition, ProcessorSpec};
    use graphbot_core::provider::{
        ChatRequest, ChatResponse, ExtractedFacts, Provider, Usage,
    };
    use graphbot_core::tool::ToolRegistry;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                message: Message::assistant("research summary"),
                usage: Usage::default(),
                model: "echo".into(),
            })
        }
        async fn chat_structured(
            &self,
            _m: Vec<Message>,
            _s: serde_json::Value,
            _model: &str,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }
        async fn summarize(&self, _m: &[Message], _model: &str) -> String {
            String::new()
        }
        async fn extract_facts(&self, _m: &[Message], _model: &str) -> ExtractedFacts {
            ExtractedFacts::default()
        }
    }

    async fn worker_with(port: Arc<RecordingPort>) -> (SubagentWorker, Store) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let bus = Arc::new(EventBus::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(EchoProvider),
            Arc::new(ToolRegistry::new()),
            port,
            store.clone(),
            bus.clone(),
            "default-model",
            300,
        ));
        (SubagentWorker::new(store.clone(), dispatcher, bus), store)
    }

    fn agent_plan() -> ExecutionPlan {
        ExecutionPlan {
            execution: Execution::Immediate,
            delay_seconds: None,
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor: ProcessorSpec::Agent {
                prompt: "Research the topic and send the result.".into(),
                tools: vec![],
                model: None,
            },
        }
    }

    #[tokio::test]
    async fn completed_task_has_exactly_one_result_event() {
        let port = Arc::new(RecordingPort::default());
        let (worker, store) = worker_with(port).await;

        let task_id = worker
            .spawn("alice", None, agent_plan(), "research rust async", "api")
            .await
            .unwrap();
        worker.shutdown().await;

        let task = store.get_background_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, task_status::COMPLETED);
        assert_eq!(task.result.as_deref(), Some("research summary"));
        assert!(task.completed_at.is_some());

        let events = store.undelivered_events("alice").await.unwrap();
        let results: Vec<_> = events
            .iter()
            .filter(|e| e.kind == KIND_SUBAGENT_RESULT && e.payload["task_id"] == task_id.as_str())
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["result"], "research summary");
    }

    #[tokio::test]
    async fn open_parent_session_gets_direct_push() {
        let port = Arc::new(RecordingPort::default());
        let (worker, store) = worker_with(port.clone()).await;
        let session = store.open_session("alice", "telegram").await.unwrap();

        worker
            .spawn(
                "alice",
                Some(&session.session_id),
                agent_plan(),
                "quick research",
                "telegram",
            )
            .await
            .unwrap();
        worker.shutdown().await;

        // Pushed directly and therefore marked delivered
        assert_eq!(port.sent.lock().unwrap().len(), 1);
        assert!(store.undelivered_events("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_parent_session_leaves_event_queued() {
        let port = Arc::new(RecordingPort::default());
        let (worker, store) = worker_with(port.clone()).await;
        let session = store.open_session("alice", "telegram").await.unwrap();
        store
            .end_session(&session.session_id, "done", "manual")
            .await
            .unwrap();

        worker
            .spawn(
                "alice",
                Some(&session.session_id),
                agent_plan(),
                "slow research",
                "telegram",
            )
            .await
            .unwrap();
        worker.shutdown().await;

        assert!(port.sent.lock().unwrap().is_empty());
        assert_eq!(store.undelivered_events("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_task_records_error() {
        let port = Arc::new(RecordingPort::default());
        let (worker, store) = worker_with(port).await;

        let plan = ExecutionPlan {
            execution: Execution::Immediate,
            delay_seconds: None,
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor: ProcessorSpec::Function {
                tool_name: "ghost_tool".into(),
                tool_args: serde_json::json!({}),
            },
        };
        let task_id = worker.spawn("alice", None, plan, "task", "api").await.unwrap();
        worker.shutdown().await;

        let task = store.get_background_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, task_status::FAILED);
        assert!(task.error.as_deref().unwrap().contains("ghost_tool"));
        assert!(store.undelivered_events("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_count_drains_after_shutdown() {
        let port = Arc::new(RecordingPort::default());
        let (worker, _store) = worker_with(port).await;
        worker
            .spawn("alice", None, agent_plan(), "task", "api")
            .await
            .unwrap();
        worker.shutdown().await;
        assert_eq!(worker.running_count(), 0);
    }
}
