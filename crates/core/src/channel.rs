//! Channel port — the outbound delivery seam.
//!
//! The runtime only ever needs one operation from a channel: deliver text
//! to a `(user, channel)` pair. Everything platform-specific (transports,
//! chat ids, webhooks) lives behind this trait in the channels crate.

use async_trait::async_trait;

use crate::error::ChannelError;

/// Abstract "send text to (user, channel)".
///
/// Implementations enforce the bot-voice prefix policy: autonomous
/// messages on shared-identity transports carry the configured marker so
/// inbound self-echoes can be dropped.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Deliver `text` to `user_id` on `channel`. Returns an error when the
    /// user has no link for the channel or the transport fails.
    async fn send(&self, user_id: &str, channel: &str, text: &str)
        -> std::result::Result<(), ChannelError>;
}

pub mod test_support {
    //! A recording channel port shared by tests across the workspace.

    use super::*;
    use std::sync::Mutex;

    /// Records every send; optionally fails for a given channel.
    #[derive(Default)]
    pub struct RecordingPort {
        pub sent: Mutex<Vec<(String, String, String)>>,
        pub fail_channel: Option<String>,
    }

    #[async_trait]
    impl ChannelPort for RecordingPort {
        async fn send(
            &self,
            user_id: &str,
            channel: &str,
            text: &str,
        ) -> std::result::Result<(), ChannelError> {
            if self.fail_channel.as_deref() == Some(channel) {
                return Err(ChannelError::DeliveryFailed {
                    channel: channel.into(),
                    reason: "forced failure".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((user_id.into(), channel.into(), text.into()));
            Ok(())
        }
    }
}
