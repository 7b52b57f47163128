//! Outbound delivery mux — the concrete [`ChannelPort`].
//!
//! Resolves `(user, channel)` to a transport address through the store's
//! channel links, applies the bot-voice prefix on shared-identity
//! transports, splits long messages under the channel's size limit, and
//! hands the chunks to the registered transport.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use graphbot_config::ChannelConfig;
use graphbot_core::channel::ChannelPort;
use graphbot_core::error::ChannelError;
use graphbot_store::Store;

use crate::prefix::{split_message, BotVoice};

/// A platform transport: deliver text to a platform-native address.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send_text(&self, address: &str, text: &str)
        -> std::result::Result<(), ChannelError>;
}

struct TransportEntry {
    transport: Arc<dyn Transport>,
    /// Own bot account on the platform — skip the bot-voice prefix
    own_identity: bool,
    message_limit: usize,
}

/// Routes outbound sends to the right transport with prefix and
/// splitting policy applied.
pub struct ChannelMux {
    store: Store,
    voice: BotVoice,
    transports: HashMap<String, TransportEntry>,
}

impl ChannelMux {
    pub fn new(store: Store, voice: BotVoice) -> Self {
        Self {
            store,
            voice,
            transports: HashMap::new(),
        }
    }

    /// Register a transport under a channel name with its config.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: &ChannelConfig,
    ) {
        let name = name.into();
        info!(channel = %name, own_identity = config.own_identity, "Registered channel transport");
        self.transports.insert(
            name,
            TransportEntry {
                transport,
                own_identity: config.own_identity,
                message_limit: config.message_limit,
            },
        );
    }

    pub fn channels(&self) -> Vec<&str> {
        self.transports.keys().map(|s| s.as_str()).collect()
    }
}

#[async_trait]
impl ChannelPort for ChannelMux {
    async fn send(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
    ) -> std::result::Result<(), ChannelError> {
        let entry = self
            .transports
            .get(channel)
            .ok_or_else(|| ChannelError::NotConfigured(channel.to_string()))?;

        let link = self
            .store
            .get_channel_link(user_id, channel)
            .await
            .map_err(|e| ChannelError::DeliveryFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| ChannelError::NoLink {
                channel: channel.to_string(),
                user_id: user_id.to_string(),
            })?;

        let text = if entry.own_identity {
            text.to_string()
        } else {
            self.voice.apply(text)
        };

        for chunk in split_message(&text, entry.message_limit) {
            entry
                .transport
                .send_text(&link.channel_address, &chunk)
                .await?;
        }
        debug!(%user_id, %channel, address = %link.channel_address, "Message delivered");
        Ok(())
    }
}
