//! The scheduler: persistent cron and one-shot triggers behind a single
//! owning task.
//!
//! The in-memory trigger table is touched by exactly one task; external
//! mutators (add / cancel / list) post [`SchedulerCommand`]s over an mpsc
//! channel and await oneshot replies. Every trigger execution is isolated:
//! one failing trigger never affects another, and each appends an
//! execution-log row. Three consecutive errors auto-pause a job.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use graphbot_core::error::{Error, SchedulerError, ToolError};
use graphbot_core::event::{KIND_CRON, KIND_REMINDER};
use graphbot_core::plan::{ExecutionPlan, NotifyCondition, ProcessorSpec};
use graphbot_store::{new_reminder, CronJobRow, ReminderRow, Store};

use crate::cron::CronExpr;
use crate::dispatch::Dispatcher;

const MAX_CONSECUTIVE_FAILURES: i64 = 3;

/// Operations posted to the scheduler task.
pub enum SchedulerCommand {
    AddJob {
        user_id: String,
        cron_expr: String,
        message: String,
        plan: ExecutionPlan,
        channel: String,
        reply: oneshot::Sender<Result<String, Error>>,
    },
    AddReminder {
        user_id: String,
        delay_seconds: Option<u64>,
        cron_expr: Option<String>,
        message: String,
        plan: ExecutionPlan,
        channel: String,
        reply: oneshot::Sender<Result<String, Error>>,
    },
    CancelJob {
        job_id: String,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    CancelReminder {
        reminder_id: String,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    ListJobs {
        user_id: Option<String>,
        reply: oneshot::Sender<Result<Vec<CronJobRow>, Error>>,
    },
    ListReminders {
        user_id: Option<String>,
        reply: oneshot::Sender<Result<Vec<ReminderRow>, Error>>,
    },
}

/// Cloneable handle for posting commands to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn send<T>(
        &self,
        cmd: SchedulerCommand,
        rx: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::Scheduler(SchedulerError::NotRunning))?;
        rx.await
            .map_err(|_| Error::Scheduler(SchedulerError::NotRunning))?
    }

    pub async fn add_job(
        &self,
        user_id: &str,
        cron_expr: &str,
        message: &str,
        plan: ExecutionPlan,
        channel: &str,
    ) -> Result<String, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SchedulerCommand::AddJob {
                user_id: user_id.into(),
                cron_expr: cron_expr.into(),
                message: message.into(),
                plan,
                channel: channel.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn add_reminder(
        &self,
        user_id: &str,
        delay_seconds: Option<u64>,
        cron_expr: Option<String>,
        message: &str,
        plan: ExecutionPlan,
        channel: &str,
    ) -> Result<String, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SchedulerCommand::AddReminder {
                user_id: user_id.into(),
                delay_seconds,
                cron_expr,
                message: message.into(),
                plan,
                channel: channel.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::CancelJob { job_id: job_id.into(), reply }, rx)
            .await
    }

    pub async fn cancel_reminder(&self, reminder_id: &str) -> Result<bool, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SchedulerCommand::CancelReminder {
                reminder_id: reminder_id.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn list_jobs(&self, user_id: Option<&str>) -> Result<Vec<CronJobRow>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SchedulerCommand::ListJobs {
                user_id: user_id.map(String::from),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn list_reminders(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReminderRow>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SchedulerCommand::ListReminders {
                user_id: user_id.map(String::from),
                reply,
            },
            rx,
        )
        .await
    }
}

enum ReminderTrigger {
    At(DateTime<Utc>),
    Cron(CronExpr),
}

struct JobEntry {
    expr: CronExpr,
    row: CronJobRow,
}

struct ReminderEntry {
    trigger: ReminderTrigger,
    row: ReminderRow,
}

/// The scheduler. Owns the trigger table; see module docs for the
/// concurrency contract.
pub struct Scheduler {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    jobs: HashMap<String, JobEntry>,
    reminders: HashMap<String, ReminderEntry>,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            jobs: HashMap::new(),
            reminders: HashMap::new(),
            last_fired: HashMap::new(),
        }
    }

    /// Load enabled jobs and pending reminders from the store into the
    /// trigger table. Expired one-shot reminders are cancelled.
    pub async fn rehydrate(&mut self) -> Result<(), Error> {
        let now = Utc::now();
        for job in self.store.cron_jobs(None).await? {
            if !job.enabled {
                continue;
            }
            match CronExpr::parse(&job.cron_expr) {
                Ok(expr) => {
                    self.jobs.insert(job.job_id.clone(), JobEntry { expr, row: job });
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Skipping job with invalid cron expression");
                }
            }
        }

        for reminder in self.store.pending_reminders(None).await? {
            match reminder.cron_expr.clone() {
                Some(expr) => match CronExpr::parse(&expr) {
                    Ok(parsed) => {
                        self.reminders.insert(
                            reminder.reminder_id.clone(),
                            ReminderEntry {
                                trigger: ReminderTrigger::Cron(parsed),
                                row: reminder,
                            },
                        );
                    }
                    Err(e) => {
                        error!(
                            reminder_id = %reminder.reminder_id,
                            error = %e,
                            "Skipping reminder with invalid cron expression"
                        );
                    }
                },
                None if reminder.run_at < now => {
                    // Missed while the process was down; do not fire stale
                    // one-shots on startup
                    info!(reminder_id = %reminder.reminder_id, "Discarding expired one-shot reminder");
                    self.store.cancel_reminder(&reminder.reminder_id).await?;
                }
                None => {
                    self.reminders.insert(
                        reminder.reminder_id.clone(),
                        ReminderEntry {
                            trigger: ReminderTrigger::At(reminder.run_at),
                            row: reminder,
                        },
                    );
                }
            }
        }

        info!(
            jobs = self.jobs.len(),
            reminders = self.reminders.len(),
            "Scheduler rehydrated"
        );
        Ok(())
    }

    /// Run the scheduler: rehydrate, then process commands and minute
    /// ticks until every handle is dropped.
    pub fn spawn(mut self) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SchedulerCommand>(64);
        let handle = tokio::spawn(async move {
            if let Err(e) = self.rehydrate().await {
                error!(error = %e, "Scheduler rehydration failed");
            }
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            debug!("All scheduler handles dropped, stopping");
                            break;
                        }
                    },
                    _ = interval.tick() => self.tick(Utc::now()).await,
                }
            }
        });
        (SchedulerHandle { tx }, handle)
    }

    /// Process one command from a handle.
    pub async fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::AddJob {
                user_id,
                cron_expr,
                message,
                plan,
                channel,
                reply,
            } => {
                let _ = reply.send(self.add_job(user_id, cron_expr, message, plan, channel).await);
            }
            SchedulerCommand::AddReminder {
                user_id,
                delay_seconds,
                cron_expr,
                message,
                plan,
                channel,
                reply,
            } => {
                let _ = reply.send(
                    self.add_reminder(user_id, delay_seconds, cron_expr, message, plan, channel)
                        .await,
                );
            }
            SchedulerCommand::CancelJob { job_id, reply } => {
                let result = self.store.remove_cron_job(&job_id).await.map_err(Error::from);
                if matches!(result, Ok(true)) {
                    self.jobs.remove(&job_id);
                    info!(%job_id, "Cron job removed");
                }
                let _ = reply.send(result);
            }
            SchedulerCommand::CancelReminder { reminder_id, reply } => {
                let result = self
                    .store
                    .cancel_reminder(&reminder_id)
                    .await
                    .map_err(Error::from);
                if matches!(result, Ok(true)) {
                    self.reminders.remove(&reminder_id);
                }
                let _ = reply.send(result);
            }
            SchedulerCommand::ListJobs { user_id, reply } => {
                let _ = reply.send(self.store.cron_jobs(user_id.as_deref()).await.map_err(Error::from));
            }
            SchedulerCommand::ListReminders { user_id, reply } => {
                let _ = reply.send(
                    self.store
                        .pending_reminders(user_id.as_deref())
                        .await
                        .map_err(Error::from),
                );
            }
        }
    }

    async fn add_job(
        &mut self,
        user_id: String,
        cron_expr: String,
        message: String,
        plan: ExecutionPlan,
        channel: String,
    ) -> Result<String, Error> {
        let expr = CronExpr::parse(&cron_expr)?;
        let job_id = short_id();
        let row = CronJobRow {
            job_id: job_id.clone(),
            user_id,
            cron_expr: cron_expr.clone(),
            message,
            channel,
            enabled: true,
            processor: plan.processor.kind().to_string(),
            plan_json: Some(serde_json::to_value(&plan)?),
            notify_condition: plan.notify_condition.as_str().to_string(),
            consecutive_failures: 0,
            created_at: Utc::now(),
        };
        self.store.add_cron_job(&row).await?;
        self.jobs.insert(job_id.clone(), JobEntry { expr, row });
        info!(%job_id, %cron_expr, "Cron job added");
        Ok(job_id)
    }

    async fn add_reminder(
        &mut self,
        user_id: String,
        delay_seconds: Option<u64>,
        cron_expr: Option<String>,
        message: String,
        plan: ExecutionPlan,
        channel: String,
    ) -> Result<String, Error> {
        let reminder_id = short_id();
        let trigger = match &cron_expr {
            Some(expr) => ReminderTrigger::Cron(CronExpr::parse(expr)?),
            None => {
                let delay = delay_seconds.ok_or_else(|| {
                    Error::Scheduler(SchedulerError::InvalidCron {
                        expr: String::new(),
                        reason: "one-shot reminder requires delay_seconds".into(),
                    })
                })?;
                ReminderTrigger::At(Utc::now() + ChronoDuration::seconds(delay as i64))
            }
        };
        let run_at = match &trigger {
            ReminderTrigger::At(at) => *at,
            ReminderTrigger::Cron(_) => Utc::now(),
        };
        let row = new_reminder(
            reminder_id.clone(),
            user_id,
            channel,
            run_at,
            cron_expr.clone(),
            message,
            plan.processor.kind().to_string(),
            Some(serde_json::to_value(&plan)?),
        );
        self.store.add_reminder(&row).await?;
        let kind = match cron_expr {
            Some(expr) => format!("recurring ({expr})"),
            None => format!("one-shot at {run_at}"),
        };
        info!(%reminder_id, %kind, "Reminder added");
        self.reminders
            .insert(reminder_id.clone(), ReminderEntry { trigger, row });
        Ok(reminder_id)
    }

    /// One scheduler tick. Due triggers run sequentially; their relative
    /// order within the same instant is unspecified.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let due_jobs: Vec<String> = self
            .jobs
            .iter()
            .filter(|(id, entry)| {
                entry.row.enabled && entry.expr.matches(&now) && !self.fired_this_minute(id, now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in due_jobs {
            self.last_fired.insert(job_id.clone(), now);
            self.execute_job(&job_id).await;
        }

        let due_reminders: Vec<String> = self
            .reminders
            .iter()
            .filter(|(id, entry)| match &entry.trigger {
                ReminderTrigger::At(at) => *at <= now,
                ReminderTrigger::Cron(expr) => {
                    expr.matches(&now) && !self.fired_this_minute(id, now)
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        for reminder_id in due_reminders {
            self.last_fired.insert(reminder_id.clone(), now);
            self.execute_reminder(&reminder_id).await;
        }
    }

    fn fired_this_minute(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.last_fired
            .get(id)
            .map(|last| {
                last.minute() == now.minute()
                    && last.hour() == now.hour()
                    && last.date_naive() == now.date_naive()
            })
            .unwrap_or(false)
    }

    /// Execute one cron job. Exactly one execution-log row per run.
    async fn execute_job(&mut self, job_id: &str) {
        let Some(entry) = self.jobs.get(job_id) else {
            return;
        };
        let job = entry.row.clone();
        info!(%job_id, user_id = %job.user_id, "Cron trigger");

        let plan = plan_of(&job.plan_json, &job.message);
        let notify_skip = job.notify_condition == NotifyCondition::NotifySkip.as_str();
        let start = Instant::now();

        let result = self
            .dispatcher
            .run_plan(&plan, &job.message, &job.channel)
            .await;
        let duration_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                if let Some(response) = &outcome.response {
                    if notify_skip && Dispatcher::should_skip(response) {
                        debug!(%job_id, "Skipped (SKIP marker in response)");
                        let _ = self
                            .store
                            .log_cron_execution(job_id, "skipped", Some(response), duration_ms)
                            .await;
                        return;
                    }
                }

                if outcome.deliver {
                    if let Some(response) = &outcome.response {
                        if let Err(e) = self
                            .dispatcher
                            .deliver(&job.user_id, &job.channel, response, KIND_CRON)
                            .await
                        {
                            self.record_job_failure(job_id, &e.to_string(), duration_ms).await;
                            return;
                        }
                    }
                }

                let result_text = outcome.response.unwrap_or_else(|| "(no output)".into());
                let _ = self
                    .store
                    .log_cron_execution(job_id, "success", Some(&result_text), duration_ms)
                    .await;
                let _ = self.store.reset_failures(job_id).await;
                if let Some(entry) = self.jobs.get_mut(job_id) {
                    entry.row.consecutive_failures = 0;
                }
            }
            Err(e) => {
                // Unknown/unavailable tool with "always": tell the user
                // instead of failing silently
                if !notify_skip
                    && matches!(
                        e,
                        Error::Tool(ToolError::NotFound(_) | ToolError::Unavailable { .. })
                    )
                {
                    let _ = self
                        .dispatcher
                        .deliver(
                            &job.user_id,
                            &job.channel,
                            &format!("Background task failed: {e}"),
                            KIND_CRON,
                        )
                        .await;
                }
                self.record_job_failure(job_id, &e.to_string(), duration_ms).await;
            }
        }
    }

    async fn record_job_failure(&mut self, job_id: &str, error_text: &str, duration_ms: i64) {
        error!(%job_id, error = %error_text, "Cron job failed");
        let _ = self
            .store
            .log_cron_execution(job_id, "error", Some(error_text), duration_ms)
            .await;
        let count = self.store.increment_failures(job_id).await.unwrap_or(0);
        if let Some(entry) = self.jobs.get_mut(job_id) {
            entry.row.consecutive_failures = count;
        }
        if count >= MAX_CONSECUTIVE_FAILURES {
            warn!(%job_id, failures = count, "Auto-pausing job after consecutive failures");
            let _ = self.store.set_job_enabled(job_id, false).await;
            self.jobs.remove(job_id);
        }
    }

    /// Execute one reminder. One-shot reminders transition
    /// pending → sent/failed and leave the trigger set; recurring ones
    /// stay pending and keep firing.
    async fn execute_reminder(&mut self, reminder_id: &str) {
        let Some(entry) = self.reminders.get(reminder_id) else {
            return;
        };
        let reminder = entry.row.clone();
        let recurring = reminder.is_recurring();
        info!(
            %reminder_id,
            user_id = %reminder.user_id,
            recurring,
            processor = %reminder.processor,
            "Reminder trigger"
        );

        let plan = plan_of(&reminder.plan_json, &reminder.message);
        let result = self
            .dispatcher
            .run_plan(&plan, &reminder.message, &reminder.channel)
            .await;

        match result {
            Ok(outcome) => {
                if let Some(response) = &outcome.response {
                    if plan.notify_condition == NotifyCondition::NotifySkip
                        && Dispatcher::should_skip(response)
                    {
                        debug!(%reminder_id, "Reminder skipped (SKIP marker)");
                        if !recurring {
                            let _ = self.store.mark_reminder_sent(reminder_id).await;
                            self.reminders.remove(reminder_id);
                        }
                        return;
                    }
                }

                if outcome.deliver {
                    if let Some(response) = &outcome.response {
                        if let Err(e) = self
                            .dispatcher
                            .deliver(&reminder.user_id, &reminder.channel, response, KIND_REMINDER)
                            .await
                        {
                            warn!(%reminder_id, error = %e, "Reminder delivery failed");
                            if !recurring {
                                let _ = self.store.mark_reminder_failed(reminder_id).await;
                                self.reminders.remove(reminder_id);
                            }
                            return;
                        }
                    }
                }

                if !recurring {
                    let _ = self.store.mark_reminder_sent(reminder_id).await;
                    self.reminders.remove(reminder_id);
                }
                info!(%reminder_id, "Reminder executed");
            }
            Err(e) => {
                error!(%reminder_id, error = %e, "Reminder failed");
                if !recurring {
                    let _ = self.store.mark_reminder_failed(reminder_id).await;
                    self.reminders.remove(reminder_id);
                }
            }
        }
    }

    /// Number of live triggers (tests and introspection).
    pub fn trigger_count(&self) -> usize {
        self.jobs.len() + self.reminders.len()
    }
}

/// The persisted plan, or a static fallback built from the row's message
/// (rows written before plans existed).
fn plan_of(plan_json: &Option<serde_json::Value>, message: &str) -> ExecutionPlan {
    if let Some(value) = plan_json {
        if let Ok(plan) = serde_json::from_value::<ExecutionPlan>(value.clone()) {
            return plan;
        }
        warn!("Unparseable plan_json, falling back to static delivery");
    }
    ExecutionPlan {
        execution: graphbot_core::plan::Execution::Delayed,
        delay_seconds: None,
        cron_expr: None,
        notify_condition: NotifyCondition::Always,
        channel: None,
        processor: ProcessorSpec::Static {
            message: message.to_string(),
        },
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
