//! # GraphBot Scheduler
//!
//! Persistent background execution: cron jobs and one-shot reminders
//! rehydrated from the store into an in-memory trigger set owned by a
//! single task, plus the subagent worker for immediate fire-and-forget
//! runs. All three processor semantics (static / function / agent) live
//! in the shared dispatcher, so scheduled and immediate work behave
//! identically.

mod cron;
mod dispatch;
mod scheduler;
mod worker;

pub use cron::CronExpr;
pub use dispatch::{Delivery, DispatchOutcome, Dispatcher};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use worker::SubagentWorker;
