//! The eight-layer context builder.
//!
//! Layer order: identity, runtime, role, agent_memory, user_context,
//! events, session_summary, skills. The first three go to every role;
//! the rest are gated by the RBAC layer set. Each layer has a token
//! budget; over-budget content keeps the most recent items (lists) or the
//! head of the text (prose).

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use graphbot_config::AssistantConfig;
use graphbot_core::error::StoreError;
use graphbot_store::Store;

use super::token::{estimate_tokens, truncate_to_tokens};

/// Per-layer token budgets (approximate, caller-truncated).
#[derive(Debug, Clone)]
pub struct LayerBudgets {
    pub identity: usize,
    pub runtime: usize,
    pub role: usize,
    pub agent_memory: usize,
    pub user_context: usize,
    pub events: usize,
    pub session_summary: usize,
    pub skills: usize,
    /// Fallback index when full skill text exceeds the skills budget
    pub skill_index: usize,
}

impl Default for LayerBudgets {
    fn default() -> Self {
        Self {
            identity: 500,
            runtime: 100,
            role: 100,
            agent_memory: 500,
            user_context: 1500,
            events: 300,
            session_summary: 500,
            skills: 1000,
            skill_index: 200,
        }
    }
}

/// A skill visible to the context builder. Parsing skill files is outside
/// this crate; sources implement [`SkillSource`].
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Always-on skills are injected as full text; others only appear in
    /// the name+description index.
    pub always: bool,
    pub content: String,
}

/// Where skills come from.
pub trait SkillSource: Send + Sync {
    fn skills(&self) -> Vec<Skill>;
}

/// A fixed in-memory skill set. `StaticSkills::default()` means no skills.
#[derive(Default)]
pub struct StaticSkills(pub Vec<Skill>);

impl SkillSource for StaticSkills {
    fn skills(&self) -> Vec<Skill> {
        self.0.clone()
    }
}

/// The assembled prompt plus the event rows it consumed.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub system_prompt: String,

    /// Ids of the events rendered into the prompt. The caller marks these
    /// delivered after a successful build.
    pub event_ids: Vec<i64>,
}

/// Builds the system prompt from the store and configuration.
pub struct ContextBuilder {
    store: Store,
    assistant: AssistantConfig,
    skills: Arc<dyn SkillSource>,
    budgets: LayerBudgets,
}

impl ContextBuilder {
    pub fn new(store: Store, assistant: AssistantConfig, skills: Arc<dyn SkillSource>) -> Self {
        Self {
            store,
            assistant,
            skills,
            budgets: LayerBudgets::default(),
        }
    }

    pub fn with_budgets(mut self, budgets: LayerBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Build the full system prompt for a user.
    pub async fn build(
        &self,
        user_id: &str,
        role: &str,
        allowed_layers: Option<&HashSet<String>>,
    ) -> Result<BuiltContext, StoreError> {
        self.build_at(user_id, role, allowed_layers, Utc::now()).await
    }

    /// Build with an explicit clock — identical inputs yield byte-identical
    /// output.
    pub async fn build_at(
        &self,
        user_id: &str,
        role: &str,
        allowed_layers: Option<&HashSet<String>>,
        now: DateTime<Utc>,
    ) -> Result<BuiltContext, StoreError> {
        let wants =
            |layer: &str| allowed_layers.map(|set| set.contains(layer)).unwrap_or(true);

        let mut sections: Vec<String> = Vec::new();
        let mut event_ids = Vec::new();

        if wants("identity") {
            sections.push(
                truncate_to_tokens(&self.identity_prompt(), self.budgets.identity).to_string(),
            );
        }

        if wants("runtime") {
            let runtime = format!(
                "# Runtime\nUser: {user_id}\nCurrent time: {}\nActive model: {}",
                now.format("%Y-%m-%d %H:%M UTC"),
                self.assistant.model,
            );
            sections.push(truncate_to_tokens(&runtime, self.budgets.runtime).to_string());
        }

        if wants("role") {
            let line = format!("# Role\n{}", role_description(role));
            sections.push(truncate_to_tokens(&line, self.budgets.role).to_string());
        }

        if wants("agent_memory") {
            if let Some(memory) = self.store.read_memory("", "long_term").await? {
                let section = format!("# Agent Memory\n\n{memory}");
                sections.push(
                    truncate_to_tokens(&section, self.budgets.agent_memory).to_string(),
                );
            }
        }

        if wants("user_context") {
            let section = self.user_context_section(user_id).await?;
            if !section.is_empty() {
                sections.push(section);
            }
        }

        if wants("events") {
            let (section, ids) = self.events_section(user_id).await?;
            if !section.is_empty() {
                sections.push(section);
                event_ids = ids;
            }
        }

        if wants("session_summary") {
            if let Some(summary) = self.store.last_session_summary(user_id).await? {
                let section = format!("# Previous Conversation\n\n{summary}");
                sections.push(
                    truncate_to_tokens(&section, self.budgets.session_summary).to_string(),
                );
            }
        }

        if wants("skills") {
            for section in self.skills_sections() {
                sections.push(section);
            }
        }

        debug!(%user_id, %role, sections = sections.len(), "Context built");
        Ok(BuiltContext {
            system_prompt: sections.join("\n\n---\n\n"),
            event_ids,
        })
    }

    /// Identity-only prompt for `skip_context` turns and background work.
    pub fn identity_prompt(&self) -> String {
        if let Some(identity) = &self.assistant.identity {
            return identity.clone();
        }
        let identity_file = self.assistant.workspace.join("AGENT.md");
        if let Ok(content) = std::fs::read_to_string(&identity_file) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        format!(
            "You are {}, a helpful AI assistant.\nBe helpful, accurate, and concise.",
            self.assistant.name
        )
    }

    /// Notes + recent activity + favorites + preferences. List layers keep
    /// the most recent items that fit the budget.
    async fn user_context_section(&self, user_id: &str) -> Result<String, StoreError> {
        let budget = self.budgets.user_context;
        let mut used = estimate_tokens("# User Context\n\n");
        let mut parts: Vec<String> = Vec::new();

        let mut push_list = |header: &str, lines: Vec<String>, used: &mut usize| {
            if lines.is_empty() {
                return;
            }
            let mut kept = Vec::new();
            let header_cost = estimate_tokens(header) + 1;
            if *used + header_cost > budget {
                return;
            }
            *used += header_cost;
            // Lines arrive newest-first; keep what fits
            for line in lines {
                let cost = estimate_tokens(&line) + 1;
                if *used + cost > budget {
                    break;
                }
                *used += cost;
                kept.push(line);
            }
            if !kept.is_empty() {
                parts.push(format!("{header}\n{}", kept.join("\n")));
            }
        };

        let notes = self.store.notes(user_id, 20).await?;
        push_list(
            "USER NOTES:",
            notes.iter().map(|n| format!("- {}", n.note)).collect(),
            &mut used,
        );

        let activities = self.store.recent_activities(user_id, 7).await?;
        push_list(
            "RECENT ACTIVITIES:",
            activities
                .iter()
                .map(|a| format!("- {}: {} ({})", a.activity_date, a.item_title, a.activity_type))
                .collect(),
            &mut used,
        );

        let favorites = self.store.favorites(user_id).await?;
        push_list(
            "FAVORITES:",
            favorites.iter().map(|f| format!("- {}", f.item_title)).collect(),
            &mut used,
        );

        let preferences = self.store.preferences(user_id).await?;
        if let Some(object) = preferences.as_object() {
            // serde_json object keys iterate sorted — deterministic output
            push_list(
                "PREFERENCES:",
                object
                    .iter()
                    .map(|(k, v)| format!("- {k}: {}", value_text(v)))
                    .collect(),
                &mut used,
            );
        }

        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("# User Context\n\n{}", parts.join("\n\n")))
    }

    /// Undelivered events rendered as bullets, most recent kept under
    /// budget. Returns the ids actually rendered.
    async fn events_section(&self, user_id: &str) -> Result<(String, Vec<i64>), StoreError> {
        let events = self.store.undelivered_events(user_id).await?;
        if events.is_empty() {
            return Ok((String::new(), Vec::new()));
        }

        let header = "# Background Notifications\n";
        let mut used = estimate_tokens(header);
        let mut kept: Vec<(i64, String)> = Vec::new();
        // Newest first for budget, rendered oldest first below
        for event in events.iter().rev() {
            let line = format!("- [{}] {}", event.kind, value_text(&event.payload));
            let cost = estimate_tokens(&line) + 1;
            if used + cost > self.budgets.events {
                break;
            }
            used += cost;
            kept.push((event.event_id, line));
        }
        if kept.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        kept.reverse();

        let ids = kept.iter().map(|(id, _)| *id).collect();
        let lines: Vec<String> = kept.into_iter().map(|(_, line)| line).collect();
        Ok((format!("{header}{}", lines.join("\n")), ids))
    }

    /// Always-on skills as full text when they fit the budget; otherwise
    /// every skill collapses into the name+description index.
    fn skills_sections(&self) -> Vec<String> {
        let skills = self.skills.skills();
        if skills.is_empty() {
            return Vec::new();
        }

        let mut sections = Vec::new();
        let always_on: Vec<&Skill> = skills.iter().filter(|s| s.always).collect();
        let full_text = always_on
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let full_fits = !always_on.is_empty()
            && estimate_tokens(&full_text) <= self.budgets.skills;

        if full_fits {
            sections.push(format!("# Active Skills\n\n{full_text}"));
        }

        // Index covers the skills not already included in full
        let indexed: Vec<&Skill> = if full_fits {
            skills.iter().filter(|s| !s.always).collect()
        } else {
            skills.iter().collect()
        };
        if !indexed.is_empty() {
            let index = indexed
                .iter()
                .map(|s| format!("- {}: {}", s.name, s.description))
                .collect::<Vec<_>>()
                .join("\n");
            let section = format!(
                "# Available Skills\n\nAsk for a skill by name when you need its full instructions.\n\n{index}"
            );
            sections.push(
                truncate_to_tokens(&section, self.budgets.skill_index).to_string(),
            );
        }
        sections
    }
}

fn role_description(role: &str) -> &'static str {
    match role {
        "owner" => "You are speaking with the owner. Full access; follow their instructions.",
        "member" => "You are speaking with a member. Personal context is available.",
        "guest" => "You are speaking with a guest. Be helpful but share no other user's data.",
        _ => "You are speaking with a user with a custom role.",
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn builder_with_data() -> (ContextBuilder, Store) {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", Some("Alice"), "member")
            .await
            .unwrap();
        let assistant = AssistantConfig {
            identity: Some("You are GraphBot, a test assistant.".into()),
            ..Default::default()
        };
        let builder = ContextBuilder::new(
            store.clone(),
            assistant,
            Arc::new(StaticSkills::default()),
        );
        (builder, store)
    }

    fn all_layers() -> HashSet<String> {
        [
            "identity",
            "runtime",
            "role",
            "agent_memory",
            "user_context",
            "events",
            "session_summary",
            "skills",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[tokio::test]
    async fn empty_sources_yield_core_layers_only() {
        let (builder, _store) = builder_with_data().await;
        let built = builder.build("alice", "member", None).await.unwrap();
        assert!(built.system_prompt.contains("GraphBot"));
        assert!(built.system_prompt.contains("# Runtime"));
        assert!(built.system_prompt.contains("# Role"));
        assert!(!built.system_prompt.contains("# User Context"));
        assert!(built.event_ids.is_empty());
    }

    #[tokio::test]
    async fn layers_are_role_gated() {
        let (builder, store) = builder_with_data().await;
        store
            .add_note("alice", "prefers tea", "conversation")
            .await
            .unwrap();

        let guest_layers: HashSet<String> =
            ["identity", "runtime", "role"].iter().map(|s| s.to_string()).collect();
        let built = builder
            .build("alice", "guest", Some(&guest_layers))
            .await
            .unwrap();
        assert!(!built.system_prompt.contains("prefers tea"));

        let built = builder
            .build("alice", "member", Some(&all_layers()))
            .await
            .unwrap();
        assert!(built.system_prompt.contains("prefers tea"));
    }

    #[tokio::test]
    async fn deterministic_for_identical_inputs() {
        let (builder, store) = builder_with_data().await;
        store
            .add_note("alice", "works at Acme", "extraction")
            .await
            .unwrap();
        store
            .merge_preferences("alice", &serde_json::json!({"language": "tr", "style": "short"}))
            .await
            .unwrap();

        let now = Utc::now();
        let a = builder
            .build_at("alice", "member", Some(&all_layers()), now)
            .await
            .unwrap();
        let b = builder
            .build_at("alice", "member", Some(&all_layers()), now)
            .await
            .unwrap();
        assert_eq!(a.system_prompt, b.system_prompt);
    }

    #[tokio::test]
    async fn events_render_and_report_ids() {
        let (builder, store) = builder_with_data().await;
        let event = store
            .enqueue_event(
                "alice",
                "subagent_result",
                &serde_json::json!("research finished"),
            )
            .await
            .unwrap();

        let built = builder.build("alice", "member", None).await.unwrap();
        assert!(built.system_prompt.contains("# Background Notifications"));
        assert!(built.system_prompt.contains("research finished"));
        assert_eq!(built.event_ids, vec![event.event_id]);
    }

    #[tokio::test]
    async fn user_context_keeps_recent_notes_under_budget() {
        let (builder, store) = builder_with_data().await;
        for i in 0..20 {
            store
                .add_note("alice", &format!("note number {i} {}", "x".repeat(200)), "conversation")
                .await
                .unwrap();
        }
        let built = builder.build("alice", "member", None).await.unwrap();
        // Newest notes are kept, the oldest dropped by the budget
        assert!(built.system_prompt.contains("note number 19"));
        assert!(!built.system_prompt.contains("note number 0 "));
    }

    #[tokio::test]
    async fn session_summary_layer_reads_last_closed() {
        let (builder, store) = builder_with_data().await;
        let session = store.open_session("alice", "api").await.unwrap();
        store
            .end_session(&session.session_id, "talked about Rust", "manual")
            .await
            .unwrap();

        let built = builder.build("alice", "member", None).await.unwrap();
        assert!(built.system_prompt.contains("# Previous Conversation"));
        assert!(built.system_prompt.contains("talked about Rust"));
    }

    #[tokio::test]
    async fn skills_full_text_within_budget() {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let skills = StaticSkills(vec![
            Skill {
                name: "greeting".into(),
                description: "How to greet".into(),
                always: true,
                content: "Always greet warmly.".into(),
            },
            Skill {
                name: "pricing".into(),
                description: "Look up prices".into(),
                always: false,
                content: "Long pricing instructions...".into(),
            },
        ]);
        let builder = ContextBuilder::new(
            store,
            AssistantConfig::default(),
            Arc::new(skills),
        );

        let built = builder.build("alice", "member", None).await.unwrap();
        assert!(built.system_prompt.contains("Always greet warmly."));
        assert!(built.system_prompt.contains("- pricing: Look up prices"));
        // Non-always skill content never appears in full
        assert!(!built.system_prompt.contains("Long pricing instructions"));
    }

    #[tokio::test]
    async fn oversized_always_skills_collapse_to_index() {
        let store = Store::open("sqlite::memory:").await.unwrap();
        store
            .get_or_create_user("alice", None, "member")
            .await
            .unwrap();
        let skills = StaticSkills(vec![Skill {
            name: "giant".into(),
            description: "An oversized skill".into(),
            always: true,
            content: "y".repeat(10_000),
        }]);
        let builder = ContextBuilder::new(
            store,
            AssistantConfig::default(),
            Arc::new(skills),
        );

        let built = builder.build("alice", "member", None).await.unwrap();
        assert!(!built.system_prompt.contains("yyyyyyyy"));
        assert!(built.system_prompt.contains("- giant: An oversized skill"));
    }
}
