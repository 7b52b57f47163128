//! Memory tools — the agent's write path into the semantic stores.

use async_trait::async_trait;

use graphbot_core::error::ToolError;
use graphbot_core::tool::Tool;
use graphbot_store::Store;

fn store_err(tool: &str, e: graphbot_core::error::StoreError) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool.into(),
        reason: e.to_string(),
    }
}

fn required<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' is required")))
}

/// Remember a fact about the user.
pub struct SaveNoteTool {
    store: Store,
}

impl SaveNoteTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveNoteTool {
    fn name(&self) -> &str {
        "save_note"
    }

    fn description(&self) -> &str {
        "Remember a fact about the user for future conversations."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "note": {"type": "string", "description": "The fact to remember"}
            },
            "required": ["user_id", "note"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let note = required(&args, "note")?;
        self.store
            .add_note(user_id, note, "conversation")
            .await
            .map_err(|e| store_err("save_note", e))?;
        Ok("Noted.".into())
    }
}

/// Set one user preference (merged into the preference document).
pub struct SetPreferenceTool {
    store: Store,
}

impl SetPreferenceTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SetPreferenceTool {
    fn name(&self) -> &str {
        "set_preference"
    }

    fn description(&self) -> &str {
        "Record a user preference (language, style, notification settings...)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "key": {"type": "string"},
                "value": {"type": "string"}
            },
            "required": ["user_id", "key", "value"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let key = required(&args, "key")?;
        let value = required(&args, "value")?;
        self.store
            .merge_preferences(user_id, &serde_json::json!({ key: value }))
            .await
            .map_err(|e| store_err("set_preference", e))?;
        Ok(format!("Preference saved: {key} = {value}"))
    }
}

/// Mark an item as a favorite.
pub struct AddFavoriteTool {
    store: Store,
}

impl AddFavoriteTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AddFavoriteTool {
    fn name(&self) -> &str {
        "add_favorite"
    }

    fn description(&self) -> &str {
        "Add an item to the user's favorites."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "item_id": {"type": "string"},
                "title": {"type": "string"}
            },
            "required": ["user_id", "title"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let title = required(&args, "title")?;
        let item_id = args["item_id"].as_str().unwrap_or(title);
        self.store
            .add_favorite(user_id, item_id, title)
            .await
            .map_err(|e| store_err("add_favorite", e))?;
        Ok(format!("Added to favorites: {title}"))
    }
}

/// Log a user activity for the recent-activity context layer.
pub struct LogActivityTool {
    store: Store,
}

impl LogActivityTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for LogActivityTool {
    fn name(&self) -> &str {
        "log_activity"
    }

    fn description(&self) -> &str {
        "Log something the user did today (shown in their recent activity)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "title": {"type": "string"},
                "activity_type": {"type": "string", "description": "Defaults to 'logged'"}
            },
            "required": ["user_id", "title"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let user_id = required(&args, "user_id")?;
        let title = required(&args, "title")?;
        let activity_type = args["activity_type"].as_str().unwrap_or("logged");
        self.store
            .log_activity(user_id, title, activity_type, None)
            .await
            .map_err(|e| store_err("log_activity", e))?;
        Ok(format!("Activity logged: {title}"))
    }
}
