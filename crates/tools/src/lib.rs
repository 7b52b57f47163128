//! # GraphBot Tools
//!
//! The built-in tool groups, registered by name so the RBAC layer can
//! grant them per role:
//!
//! - `messaging` — `send_message_to_user`
//! - `memory` — notes, preferences, favorites, activity
//! - `web` — `web_fetch` with configured shortcuts
//! - `scheduling` — reminders and cron jobs via the scheduler handle
//! - `delegation` — `delegate` (planner → worker / scheduler)
//!
//! `scheduling` and `delegation` (along with `filesystem` and `shell`)
//! never reach isolated background agents — the registry's background
//! subregistry excludes them.
//!
//! Registration is staged to follow the startup order: the background
//! groups exist before the scheduler (whose dispatcher needs them), and
//! the scheduling/delegation groups are added once the scheduler handle
//! and planner exist. New tools register into a group here; nothing else
//! needs editing.

pub mod delegate;
pub mod memory_tools;
pub mod messaging;
pub mod schedule;
pub mod web;

use std::sync::Arc;

use graphbot_config::AppConfig;
use graphbot_core::channel::ChannelPort;
use graphbot_core::tool::ToolRegistry;
use graphbot_scheduler::SchedulerHandle;
use graphbot_store::Store;

pub use delegate::DelegateTool;

/// Build the background-safe groups: messaging, memory, web. These need
/// no scheduler and are exactly what isolated background agents may use.
pub fn background_registry(
    config: &AppConfig,
    store: Store,
    port: Arc<dyn ChannelPort>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        "messaging",
        Arc::new(messaging::SendMessageTool::new(store.clone(), port)),
    );

    registry.register("memory", Arc::new(memory_tools::SaveNoteTool::new(store.clone())));
    registry.register(
        "memory",
        Arc::new(memory_tools::SetPreferenceTool::new(store.clone())),
    );
    registry.register(
        "memory",
        Arc::new(memory_tools::AddFavoriteTool::new(store.clone())),
    );
    registry.register("memory", Arc::new(memory_tools::LogActivityTool::new(store)));

    registry.register("web", Arc::new(web::WebFetchTool::new(&config.web)));

    registry
}

/// Add the scheduling group once the scheduler is running.
pub fn register_scheduling(registry: &mut ToolRegistry, scheduler: SchedulerHandle) {
    registry.register(
        "scheduling",
        Arc::new(schedule::CreateReminderTool::new(scheduler.clone())),
    );
    registry.register(
        "scheduling",
        Arc::new(schedule::CancelReminderTool::new(scheduler.clone())),
    );
    registry.register(
        "scheduling",
        Arc::new(schedule::ListRemindersTool::new(scheduler.clone())),
    );
    registry.register(
        "scheduling",
        Arc::new(schedule::CreateCronJobTool::new(scheduler.clone())),
    );
    registry.register(
        "scheduling",
        Arc::new(schedule::RemoveCronJobTool::new(scheduler)),
    );
}

/// Add the delegate tool once the planner and worker exist.
pub fn register_delegation(registry: &mut ToolRegistry, delegate: DelegateTool) {
    registry.register("delegation", Arc::new(delegate));
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphbot_core::channel::test_support::RecordingPort;

    #[tokio::test]
    async fn background_groups_survive_subregistry_derivation() {
        let store = Store::open("sqlite::memory:").await.unwrap();
        let registry = background_registry(
            &AppConfig::default(),
            store,
            Arc::new(RecordingPort::default()),
        );
        let background = registry.background_subregistry();
        assert!(background.get("send_message_to_user").is_some());
        assert!(background.get("web_fetch").is_some());
        assert!(background.get("save_note").is_some());
        assert_eq!(registry.len(), background.len());
    }
}
