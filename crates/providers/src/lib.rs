//! # GraphBot Providers
//!
//! LLM backend adapters implementing the [`graphbot_core::Provider`] port.
//! The OpenAI-compatible adapter covers the vast majority of hosted
//! endpoints; the router picks an adapter by model prefix so one process
//! can mix backends (main agent on one provider, planner on a cheaper one).

mod openai_compat;
mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::ProviderRouter;
