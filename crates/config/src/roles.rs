//! Role-definition document for RBAC.
//!
//! The role file (`roles.toml`) maps roles to tool groups, context layers,
//! and session caps. An **absent** file means the open policy: every user
//! gets every tool and every layer. A **malformed** file is a fatal
//! configuration error — silently degrading a present-but-broken policy
//! would grant more access than the operator intended.

use graphbot_core::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// A single role definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoleDef {
    /// Tool groups this role may use
    #[serde(default)]
    pub tool_groups: Vec<String>,

    /// Context layers this role receives
    #[serde(default)]
    pub context_layers: Vec<String>,

    /// Max concurrent open sessions. 0 = unlimited.
    #[serde(default)]
    pub max_sessions: u32,
}

/// The parsed role file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleFile {
    /// Role assigned to users without an explicit role
    #[serde(default = "default_role_name")]
    pub default_role: String,

    /// Optional group → tool-name expansion. Groups may also be registered
    /// in code via the tool registry; names here are unioned in.
    #[serde(default)]
    pub tool_groups: HashMap<String, Vec<String>>,

    /// Role name → definition
    #[serde(default)]
    pub roles: HashMap<String, RoleDef>,
}

fn default_role_name() -> String {
    "guest".into()
}

impl RoleFile {
    /// Load the role file. `Ok(None)` when the file does not exist (open
    /// policy); `Err` when it exists but cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Role file not found, RBAC disabled (open policy)");
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Failed to read role file {}: {e}", path.display()),
        })?;
        let file = Self::from_toml(&content)?;
        info!(
            roles = ?file.roles.keys().collect::<Vec<_>>(),
            default = %file.default_role,
            "Loaded role file"
        );
        Ok(Some(file))
    }

    /// Parse a role file from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config {
            message: format!("Malformed role file: {e}"),
        })
    }

    pub fn role(&self, name: &str) -> Option<&RoleDef> {
        self.roles.get(name)
    }
}
