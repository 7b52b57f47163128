//! System event fan-out — realtime push for background results.
//!
//! Events are durable rows first (the store's event queue is the source of
//! truth, at-least-once). This bus is the realtime mirror: producers
//! publish after enqueueing, and a connected live session can push the
//! event immediately and mark it delivered. Consumers that miss a publish
//! still see the event on the next turn via the context builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event kind emitted when a subagent task completes.
pub const KIND_SUBAGENT_RESULT: &str = "subagent_result";
/// Event kind for scheduled-job output that could not be pushed directly.
pub const KIND_CRON: &str = "cron";
/// Event kind for reminder output that could not be pushed directly.
pub const KIND_REMINDER: &str = "reminder";

/// A background event destined for a user. Mirrors the store's
/// system_events row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Row id assigned by the store
    pub event_id: i64,

    /// The user this event belongs to
    pub user_id: String,

    /// Event kind (e.g. "subagent_result")
    pub kind: String,

    /// Arbitrary JSON payload
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

/// A broadcast-based bus for system events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Publishing
/// with no subscribers is fine — the durable queue already has the event.
pub struct EventBus {
    sender: broadcast::Sender<Arc<SystemEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SystemEvent) {
        // No subscribers is not an error — the store row remains
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SystemEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
