//! Inter-user messaging through the channel port.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use graphbot_core::channel::ChannelPort;
use graphbot_core::error::ToolError;
use graphbot_core::tool::Tool;
use graphbot_store::Store;

/// Send a message to another user via their configured channel.
pub struct SendMessageTool {
    store: Store,
    port: Arc<dyn ChannelPort>,
}

impl SendMessageTool {
    pub fn new(store: Store, port: Arc<dyn ChannelPort>) -> Self {
        Self { store, port }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message_to_user"
    }

    fn description(&self) -> &str {
        "Send a message to another user via their configured channel.\n\
         Looks up the recipient by user id or display name and delivers \
         the text over the given channel (channel is auto-filled from the \
         conversation when omitted)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "target_user": {
                    "type": "string",
                    "description": "Recipient user id or display name (e.g. \"Murat\", \"zeynep\")"
                },
                "message": {
                    "type": "string",
                    "description": "The message text to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Delivery channel (auto-filled from the session when omitted)"
                }
            },
            "required": ["target_user", "message"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let target = required_str(&arguments, "target_user")?;
        let message = required_str(&arguments, "message")?;
        let channel = arguments["channel"].as_str().unwrap_or("api").to_string();

        // Exact user id first, then case-insensitive display name
        let user = match self.store.get_user(&target).await.map_err(store_err)? {
            Some(user) => user,
            None => {
                let all = self.store.list_users().await.map_err(store_err)?;
                let matches: Vec<_> = all
                    .iter()
                    .filter(|u| {
                        u.display_name
                            .as_deref()
                            .map(|n| n.eq_ignore_ascii_case(&target))
                            .unwrap_or(false)
                    })
                    .collect();
                match matches.len() {
                    0 => {
                        let known: Vec<String> = all
                            .iter()
                            .map(|u| u.display_name.clone().unwrap_or_else(|| u.user_id.clone()))
                            .collect();
                        return Ok(format!(
                            "User '{target}' not found. Available users: {}",
                            known.join(", ")
                        ));
                    }
                    1 => matches[0].clone(),
                    _ => {
                        let names: Vec<String> = matches
                            .iter()
                            .map(|u| {
                                format!(
                                    "{} ({})",
                                    u.display_name.as_deref().unwrap_or("?"),
                                    u.user_id
                                )
                            })
                            .collect();
                        return Ok(format!(
                            "Multiple users named '{target}': {}. Use the user id instead.",
                            names.join(", ")
                        ));
                    }
                }
            }
        };

        let display = user.display_name.clone().unwrap_or_else(|| user.user_id.clone());
        match self.port.send(&user.user_id, &channel, &message).await {
            Ok(()) => {
                info!(target = %user.user_id, %channel, "Message sent to user");
                Ok(format!("Message sent to {display} via {channel}."))
            }
            Err(e) => Ok(format!("Failed to send message to {display}: {e}")),
        }
    }
}

fn required_str(args: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' is required")))
}

fn store_err(e: graphbot_core::error::StoreError) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "send_message_to_user".into(),
        reason: e.to_string(),
    }
}
