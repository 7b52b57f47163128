//! The inbound gate — webhook payload admission.
//!
//! A channel adapter extracts `(channel_address, text, is_from_self,
//! is_group, group_address)` from the platform payload; the gate decides
//! what happens: drop (self-echo, allowlists), observe (monitored DMs),
//! or process under a resolved user identity.

use tracing::{debug, info};

use graphbot_config::{AppConfig, ChannelConfig};
use graphbot_core::error::Error;
use graphbot_store::Store;

use crate::prefix::BotVoice;

/// A normalized inbound message, platform specifics already stripped.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub channel_address: String,
    pub text: String,
    pub is_from_self: bool,
    pub is_group: bool,
    pub group_address: Option<String>,
}

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    /// Run it through the agent as `user_id`
    Process { user_id: String },
    /// Store it for context but do not respond (monitored DMs)
    Observe { user_id: String },
    /// Do not touch it
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SelfEcho,
    ChannelDisabled,
    GroupNotAllowed,
    DmNotAllowed,
    UnknownUser,
}

/// Applies channel scoping and identity resolution to inbound messages.
pub struct InboundGate {
    store: Store,
    voice: BotVoice,
    channels: std::collections::HashMap<String, ChannelConfig>,
    /// Auto-create users from channel identities. Off in owner mode.
    auto_create: bool,
    default_role: String,
}

impl InboundGate {
    pub fn new(store: Store, config: &AppConfig, default_role: impl Into<String>) -> Self {
        Self {
            store,
            voice: BotVoice::new(config.bot_prefix.clone()),
            channels: config.channels.clone(),
            auto_create: config.assistant.owner.is_none(),
            default_role: default_role.into(),
        }
    }

    /// Decide what to do with one inbound message.
    pub async fn admit(&self, msg: &InboundMessage) -> Result<InboundDecision, Error> {
        let Some(channel_cfg) = self.channels.get(&msg.channel).filter(|c| c.enabled) else {
            return Ok(InboundDecision::Drop(DropReason::ChannelDisabled));
        };

        // Loop-break: our own voice echoed back by a shared-identity
        // transport
        if self.voice.is_self_echo(&msg.text, msg.is_from_self) {
            debug!(channel = %msg.channel, "Dropping self-echo");
            return Ok(InboundDecision::Drop(DropReason::SelfEcho));
        }

        if msg.is_group {
            let allowed = msg
                .group_address
                .as_deref()
                .map(|g| channel_cfg.allowed_groups.iter().any(|a| a == g))
                .unwrap_or(false);
            if !allowed {
                return Ok(InboundDecision::Drop(DropReason::GroupNotAllowed));
            }
        } else {
            let dm_known = channel_cfg.allowed_dms.is_empty()
                || channel_cfg
                    .allowed_dms
                    .iter()
                    .any(|a| a == &msg.channel_address);
            if !dm_known {
                return Ok(InboundDecision::Drop(DropReason::DmNotAllowed));
            }
            if !channel_cfg.respond_to_dm && !channel_cfg.monitor_dm {
                return Ok(InboundDecision::Drop(DropReason::DmNotAllowed));
            }
        }

        let Some(user_id) = self.resolve_user(&msg.channel, &msg.channel_address).await? else {
            return Ok(InboundDecision::Drop(DropReason::UnknownUser));
        };

        if !msg.is_group && !channel_cfg.respond_to_dm && channel_cfg.monitor_dm {
            return Ok(InboundDecision::Observe { user_id });
        }
        Ok(InboundDecision::Process { user_id })
    }

    /// Resolve a channel identity, creating `{channel}_{address}` users
    /// when auto-creation is enabled.
    async fn resolve_user(
        &self,
        channel: &str,
        address: &str,
    ) -> Result<Option<String>, Error> {
        if let Some(user_id) = self.store.resolve_channel(channel, address).await? {
            return Ok(Some(user_id));
        }
        if !self.auto_create {
            return Ok(None);
        }
        let user_id = format!("{channel}_{address}");
        self.store
            .get_or_create_user(&user_id, None, &self.default_role)
            .await?;
        self.store
            .link_channel(&user_id, channel, address, serde_json::json!({}))
            .await?;
        info!(%user_id, %channel, "Auto-created user from channel identity");
        Ok(Some(user_id))
    }
}
