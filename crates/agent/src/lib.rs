//! # GraphBot Agent
//!
//! The agent core: a stateless four-node execution graph
//! (`load_context → reason ⇄ execute_tools → respond`), the GraphRunner
//! orchestrating it against the durable store, the layered context
//! builder, role-based access control, the isolated LightAgent for
//! background work, and the delegation planner.
//!
//! Nothing in this crate holds state across turns — the store is the only
//! synchronizer. The graph is compiled once at startup with the full tool
//! set; per-turn RBAC filtering happens in the graph state.

pub mod context;
pub mod delegation;
pub mod graph;
pub mod light;
pub mod limiter;
pub mod permissions;
pub mod runner;
pub mod state;

pub use delegation::DelegationPlanner;
pub use graph::AgentGraph;
pub use light::{LightAgent, LightRun};
pub use limiter::RateLimiter;
pub use permissions::RolePolicy;
pub use runner::GraphRunner;
pub use state::AgentState;
