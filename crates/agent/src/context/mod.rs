//! Layered system-prompt assembly.
//!
//! The context builder produces the system prompt from up to eight ordered
//! layers, each with its own token budget and role gate. Missing sources
//! yield omitted sections, never errors, and identical inputs produce
//! byte-identical output.

mod builder;
pub mod token;

pub use builder::{BuiltContext, ContextBuilder, LayerBudgets, Skill, SkillSource, StaticSkills};
