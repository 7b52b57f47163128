//! # GraphBot Channels
//!
//! The channel layer: an outbound mux implementing the
//! [`graphbot_core::ChannelPort`] over pluggable transports, the
//! bot-voice prefix policy (identity signalling **and** loop-break filter,
//! one concept), and the inbound gate that normalizes webhook payloads,
//! applies group/DM allowlists, and resolves channel identities to users.
//!
//! Concrete platform adapters (Telegram, WhatsApp bridges, ...) implement
//! the [`Transport`] seam outside this crate.

mod inbound;
mod outbound;
mod prefix;

pub use inbound::{DropReason, InboundDecision, InboundGate, InboundMessage};
pub use outbound::{ChannelMux, Transport};
pub use prefix::{split_message, BotVoice};
