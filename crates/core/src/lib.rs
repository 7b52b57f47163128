//! # GraphBot Core
//!
//! Domain types, traits, and error definitions for the GraphBot assistant
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is defined as a trait here: the LLM provider,
//! the channel delivery port, the tool surface. Implementations live in
//! their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod channel;
pub mod error;
pub mod event;
pub mod message;
pub mod plan;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use channel::ChannelPort;
pub use error::{Error, Result};
pub use event::{EventBus, SystemEvent};
pub use message::{Message, Role, ToolCall};
pub use plan::{Execution, ExecutionPlan, NotifyCondition, ProcessorSpec};
pub use provider::{ChatRequest, ChatResponse, ExtractedFacts, Provider, ToolDefinition, Usage};
pub use tool::{Tool, ToolRegistry, ToolRequirements};
