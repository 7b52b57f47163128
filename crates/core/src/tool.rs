//! Tool trait and grouped registry — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world: send
//! messages, schedule reminders, fetch web pages, record notes. Tools are
//! registered into named **groups**; the permission layer grants roles
//! access to groups, and background agents receive a restricted
//! subregistry.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Groups that are never handed to isolated background agents.
pub const RESTRICTED_GROUPS: [&str; 4] = ["filesystem", "shell", "scheduling", "delegation"];

/// External requirements a tool needs at runtime. Tools with unmet
/// requirements stay registered as `available = false` so the permission
/// layer can still reference them by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRequirements {
    /// Binaries that must be present on PATH
    pub binaries: Vec<String>,

    /// Environment variables that must be set and non-empty
    pub env_vars: Vec<String>,
}

impl ToolRequirements {
    /// Check requirements against the current process environment.
    /// Returns the first unmet requirement, or None if all are satisfied.
    pub fn unmet(&self) -> Option<String> {
        for var in &self.env_vars {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                return Some(format!("env var {var} not set"));
            }
        }
        for bin in &self.binaries {
            if !binary_on_path(bin) {
                return Some(format!("binary '{bin}' not on PATH"));
            }
        }
        None
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// The core Tool trait.
///
/// Each tool implements this trait and registers into a group. Tool output
/// is plain text — errors are observable outputs the LLM can react to.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "send_message_to_user").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM; the first
    /// line is also used in the delegation planner's tool catalog).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// External requirements. Default: none.
    fn requirements(&self) -> ToolRequirements {
        ToolRequirements::default()
    }

    /// Per-tool execution timeout in seconds. Default: 60.
    fn timeout_secs(&self) -> u64 {
        60
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value)
        -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    group: String,
    available: bool,
}

/// A registry of tools organized into named groups.
///
/// Groups are the permission unit: a role grants tool groups, and the
/// background subregistry is derived by excluding [`RESTRICTED_GROUPS`].
/// Group iteration order is deterministic (BTreeMap) so tool catalogs and
/// definitions render identically across runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    groups: BTreeMap<String, Vec<String>>,
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool into a group. Availability is probed once at
    /// registration time from the tool's requirements.
    pub fn register(&mut self, group: impl Into<String>, tool: Arc<dyn Tool>) {
        let group = group.into();
        let name = tool.name().to_string();
        let available = match tool.requirements().unmet() {
            Some(reason) => {
                warn!(tool = %name, %reason, "Tool registered as unavailable");
                false
            }
            None => true,
        };
        self.groups.entry(group.clone()).or_default().push(name.clone());
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                group,
                available,
            },
        );
    }

    /// Get a tool by name, whether or not it is available.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    /// Get a tool by name, failing if it is unavailable.
    pub fn get_available(&self, name: &str) -> std::result::Result<Arc<dyn Tool>, ToolError> {
        let reg = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if !reg.available {
            return Err(ToolError::Unavailable {
                tool_name: name.to_string(),
                reason: "requirements not met".into(),
            });
        }
        Ok(reg.tool.clone())
    }

    /// Whether a tool is registered and available.
    pub fn is_available(&self, name: &str) -> bool {
        self.tools.get(name).map(|r| r.available).unwrap_or(false)
    }

    /// All registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// All group names, sorted.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Union of tool names in the given groups. Unknown group names are
    /// logged and skipped, not fatal.
    pub fn tools_in_groups<'a, I>(&self, groups: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashSet::new();
        for group in groups {
            match self.groups.get(group) {
                Some(names) => out.extend(names.iter().cloned()),
                None => warn!(%group, "Unknown tool group, skipping"),
            }
        }
        out
    }

    /// Tool definitions for the LLM, sorted by name. `filter` restricts to
    /// the given names (RBAC); unavailable tools are always excluded.
    pub fn definitions(&self, filter: Option<&HashSet<String>>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|r| r.available)
            .filter(|r| filter.map(|f| f.contains(r.tool.name())).unwrap_or(true))
            .map(|r| r.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve tool name strings to tool handles. Unknown or unavailable
    /// names are logged and skipped.
    pub fn resolve(&self, names: &[String]) -> Vec<Arc<dyn Tool>> {
        let mut resolved = Vec::new();
        for name in names {
            match self.tools.get(name.as_str()) {
                Some(r) if r.available => resolved.push(r.tool.clone()),
                Some(_) => warn!(tool = %name, "Tool unavailable, skipping"),
                None => warn!(tool = %name, "Tool not found in registry, skipping"),
            }
        }
        resolved
    }

    /// Derive the background-safe subregistry: everything except the
    /// restricted groups. Isolated background agents never schedule,
    /// delegate, or touch the filesystem/shell.
    pub fn background_subregistry(&self) -> ToolRegistry {
        let mut sub = ToolRegistry::new();
        for (group, names) in &self.groups {
            if RESTRICTED_GROUPS.contains(&group.as_str()) {
                continue;
            }
            for name in names {
                if let Some(r) = self.tools.get(name) {
                    sub.groups
                        .entry(group.clone())
                        .or_default()
                        .push(name.clone());
                    sub.tools.insert(name.clone(), r.clone());
                }
            }
        }
        sub
    }

    /// Human-readable tool catalog for the delegation planner prompt.
    /// One line per available tool: `- name: first line of description`.
    pub fn catalog(&self) -> String {
        let mut lines: Vec<String> = self
            .tools
            .values()
            .filter(|r| r.available)
            .map(|r| {
                let first_line = r.tool.description().lines().next().unwrap_or("");
                format!("- {}: {}", r.tool.name(), first_line)
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }

    /// Which group a tool belongs to.
    pub fn group_of(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|r| r.group.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Echoes back the input\nSecond line is not shown in the catalog."
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
        ) -> std::result::Result<String, ToolError> {
            Ok(arguments["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct NeedsMissingEnv;

    #[async_trait]
    impl Tool for NeedsMissingEnv {
        fn name(&self) -> &str {
            "needs_env"
        }
        fn description(&self) -> &str {
            "Requires an env var that does not exist"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn requirements(&self) -> ToolRequirements {
            ToolRequirements {
                binaries: vec![],
                env_vars: vec!["GRAPHBOT_TEST_DEFINITELY_UNSET_VAR".into()],
            }
        }
        async fn execute(
            &self,
            _arguments: serde_json::Value,
        ) -> std::result::Result<String, ToolError> {
            Ok(String::new())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register("messaging", Arc::new(EchoTool { name: "send_message_to_user" }));
        reg.register("web", Arc::new(EchoTool { name: "web_fetch" }));
        reg.register("scheduling", Arc::new(EchoTool { name: "create_reminder" }));
        reg.register("shell", Arc::new(EchoTool { name: "run_shell" }));
        reg
    }

    #[test]
    fn register_and_lookup() {
        let reg = registry();
        assert!(reg.get("web_fetch").is_some());
        assert!(reg.get("nonexistent").is_none());
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn unmet_requirements_mark_unavailable() {
        let mut reg = ToolRegistry::new();
        reg.register("web", Arc::new(NeedsMissingEnv));
        // Still known to the registry, but not available
        assert!(reg.get("needs_env").is_some());
        assert!(!reg.is_available("needs_env"));
        assert!(reg.definitions(None).is_empty());
        assert!(matches!(
            reg.get_available("needs_env"),
            Err(ToolError::Unavailable { .. })
        ));
    }

    #[test]
    fn tools_in_groups_unions_and_skips_unknown() {
        let reg = registry();
        let names = reg.tools_in_groups(["messaging", "web", "no_such_group"]);
        assert_eq!(names.len(), 2);
        assert!(names.contains("send_message_to_user"));
        assert!(names.contains("web_fetch"));
    }

    #[test]
    fn definitions_respect_filter() {
        let reg = registry();
        let mut filter = HashSet::new();
        filter.insert("web_fetch".to_string());
        let defs = reg.definitions(Some(&filter));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "web_fetch");
    }

    #[test]
    fn background_subregistry_excludes_restricted_groups() {
        let reg = registry();
        let sub = reg.background_subregistry();
        assert!(sub.get("send_message_to_user").is_some());
        assert!(sub.get("web_fetch").is_some());
        assert!(sub.get("create_reminder").is_none());
        assert!(sub.get("run_shell").is_none());
    }

    #[test]
    fn catalog_uses_first_description_line() {
        let reg = registry();
        let catalog = reg.catalog();
        assert!(catalog.contains("- web_fetch: Echoes back the input"));
        assert!(!catalog.contains("Second line"));
    }

    #[test]
    fn resolve_skips_unknown_names() {
        let reg = registry();
        let tools = reg.resolve(&["web_fetch".into(), "ghost_tool".into()]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "web_fetch");
    }

    #[test]
    fn catalog_is_deterministic() {
        let reg = registry();
        assert_eq!(reg.catalog(), reg.catalog());
        let defs = reg.definitions(None);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
