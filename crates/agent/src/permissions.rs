//! Role-based access control: role → tool names, context layers, session
//! cap.
//!
//! The policy degrades **open** when no role file is present: every caller
//! gets every tool and every layer (backward compatibility with
//! deployments that never configured roles). A present-but-unknown role is
//! treated restrictively.

use std::collections::HashSet;
use tracing::warn;

use graphbot_config::RoleFile;
use graphbot_core::tool::ToolRegistry;

/// Context layers every role receives, even unknown ones.
const MINIMAL_LAYERS: [&str; 3] = ["identity", "runtime", "role"];

/// The loaded RBAC policy. Cheap to share behind an Arc.
pub struct RolePolicy {
    file: Option<RoleFile>,
}

impl RolePolicy {
    /// Build from an optional role file. `None` = open policy.
    pub fn new(file: Option<RoleFile>) -> Self {
        Self { file }
    }

    /// Open policy — everything allowed. Used when the role file is absent.
    pub fn open() -> Self {
        Self { file: None }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_none()
    }

    /// The role assigned to users without one.
    pub fn default_role(&self) -> &str {
        self.file
            .as_ref()
            .map(|f| f.default_role.as_str())
            .unwrap_or("guest")
    }

    /// Tool names a role may use. `None` = no filtering (open policy).
    ///
    /// Group names resolve through the registry's in-code groups unioned
    /// with the role file's optional `tool_groups` expansion. Unknown
    /// groups are logged and skipped.
    pub fn allowed_tools(&self, role: &str, registry: &ToolRegistry) -> Option<HashSet<String>> {
        let file = self.file.as_ref()?;
        let Some(def) = file.role(role) else {
            warn!(%role, "Unknown role, denying all tools");
            return Some(HashSet::new());
        };

        let mut allowed: HashSet<String> =
            registry.tools_in_groups(def.tool_groups.iter().map(|g| g.as_str()));
        for group in &def.tool_groups {
            if let Some(names) = file.tool_groups.get(group) {
                allowed.extend(names.iter().cloned());
            }
        }
        Some(allowed)
    }

    /// Context layer names a role receives. `None` = all layers.
    pub fn allowed_layers(&self, role: &str) -> Option<HashSet<String>> {
        let file = self.file.as_ref()?;
        match file.role(role) {
            Some(def) => Some(def.context_layers.iter().cloned().collect()),
            None => Some(MINIMAL_LAYERS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Max concurrent open sessions for a role. 0 = unlimited.
    pub fn max_sessions(&self, role: &str) -> u32 {
        let Some(file) = self.file.as_ref() else {
            return 0;
        };
        match file.role(role) {
            Some(def) => def.max_sessions,
            None => 1, // unknown role → restrictive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graphbot_core::error::ToolError;
    use graphbot_core::tool::Tool;
    use std::sync::Arc;

    struct StubTool(&'static str);

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register("web", Arc::new(StubTool("web_fetch")));
        reg.register("web", Arc::new(StubTool("web_search")));
        reg.register("filesystem", Arc::new(StubTool("read_file")));
        reg
    }

    fn policy() -> RolePolicy {
        let file = RoleFile::from_toml(
            r#"
            default_role = "guest"

            [tool_groups]
            extras = ["special_tool"]

            [roles.member]
            tool_groups = ["web", "extras"]
            context_layers = ["identity", "runtime", "role", "user_context"]
            max_sessions = 0

            [roles.guest]
            tool_groups = ["web"]
            context_layers = ["identity", "runtime", "role"]
            max_sessions = 1
            "#,
        )
        .unwrap();
        RolePolicy::new(Some(file))
    }

    #[test]
    fn open_policy_allows_everything() {
        let policy = RolePolicy::open();
        assert!(policy.allowed_tools("anyone", &registry()).is_none());
        assert!(policy.allowed_layers("anyone").is_none());
        assert_eq!(policy.max_sessions("anyone"), 0);
    }

    #[test]
    fn role_resolves_registry_and_file_groups() {
        let policy = policy();
        let allowed = policy.allowed_tools("member", &registry()).unwrap();
        assert!(allowed.contains("web_fetch"));
        assert!(allowed.contains("web_search"));
        assert!(allowed.contains("special_tool")); // from the role file expansion
        assert!(!allowed.contains("read_file"));
    }

    #[test]
    fn guest_excludes_filesystem() {
        let policy = policy();
        let allowed = policy.allowed_tools("guest", &registry()).unwrap();
        assert!(!allowed.contains("read_file"));
        assert_eq!(policy.max_sessions("guest"), 1);
    }

    #[test]
    fn unknown_role_denies_tools_minimal_layers() {
        let policy = policy();
        assert!(policy
            .allowed_tools("intruder", &registry())
            .unwrap()
            .is_empty());
        let layers = policy.allowed_layers("intruder").unwrap();
        assert_eq!(layers.len(), 3);
        assert!(layers.contains("identity"));
        assert_eq!(policy.max_sessions("intruder"), 1);
    }

    #[test]
    fn layers_come_from_role_definition() {
        let policy = policy();
        let layers = policy.allowed_layers("member").unwrap();
        assert!(layers.contains("user_context"));
        assert!(!layers.contains("skills"));
    }
}
