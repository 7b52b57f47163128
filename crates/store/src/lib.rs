//! # GraphBot Store
//!
//! Single-writer SQLite store — the single source of truth for users,
//! sessions, messages, semantic memory, scheduled jobs, background tasks,
//! and the system event queue. Fifteen entities, one database file, WAL
//! journaling.
//!
//! The store is the only synchronizer in the runtime: the agent graph keeps
//! no state across turns, and the scheduler rehydrates its trigger set from
//! these tables at startup.

mod events;
mod jobs;
mod memory;
mod messages;
mod rows;
mod sessions;
mod store;

pub use jobs::new_reminder;
pub use rows::*;
pub use store::Store;

/// Session close reason: token budget exceeded.
pub const CLOSE_TOKEN_LIMIT: &str = "token_limit";
/// Session close reason: explicit close.
pub const CLOSE_MANUAL: &str = "manual";
