//! Agent session pool and system prompt assembly.
//!
//! One in-memory [`AgentSession`] per session id, holding the conversation
//! message list and the assembled system prompt. Eviction is explicit
//! (reset/delete), never LRU.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ag_domain::config::AgentConfig;
use ag_domain::tool::{Message, Role};
use ag_sessions::store::SystemPromptReport;

use crate::hooks::{HookContext, HookRegistry};
use crate::skills;
use crate::workspace::{BootstrapFile, WorkspaceReader};

/// In-memory runtime state for one session id.
pub struct AgentSession {
    pub session_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
}

impl AgentSession {
    fn new(session_id: &str, session_key: &str, agent_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            session_key: session_key.to_owned(),
            agent_id: agent_id.to_owned(),
            system_prompt: None,
            messages: Vec::new(),
        }
    }

    /// Last `limit` messages (everything when `limit` is `None`).
    pub fn history(&self, limit: Option<usize>) -> Vec<Message> {
        match limit {
            Some(n) if n < self.messages.len() => {
                self.messages[self.messages.len() - n..].to_vec()
            }
            _ => self.messages.clone(),
        }
    }

    /// Inject a message without running a turn (`chat.inject`).
    pub fn inject(&mut self, role: Role, content: String) {
        self.messages.push(Message {
            role,
            content: ag_domain::tool::MessageContent::Text(content),
        });
    }
}

/// Pool of live agent sessions, keyed by session id.
#[derive(Default)]
pub struct AgentSessions {
    map: Mutex<HashMap<String, Arc<Mutex<AgentSession>>>>,
}

impl AgentSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        session_id: &str,
        session_key: &str,
        agent_id: &str,
    ) -> Arc<Mutex<AgentSession>> {
        self.map
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AgentSession::new(session_id, session_key, agent_id)))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<AgentSession>>> {
        self.map.lock().get(session_id).cloned()
    }

    /// Discard a session (on reset or registry delete).
    pub fn evict(&self, session_id: &str) -> bool {
        self.map.lock().remove(session_id).is_some()
    }

    /// Force prompt reassembly on the next turn.
    pub fn invalidate_prompt(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.lock().system_prompt = None;
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assemble the system prompt for a session:
/// bootstrap files (after the `agent:bootstrap` hook has had its say),
/// the `<available_skills>` section, then the configured suffix.
pub async fn assemble_system_prompt(
    config: &AgentConfig,
    workspace: &WorkspaceReader,
    hooks: &HookRegistry,
    ctx: &HookContext,
) -> (String, SystemPromptReport) {
    let mut files = workspace.read_bootstrap_files(&config.bootstrap_files);

    // The bootstrap hook may mutate, add, or drop files. The last handler
    // returning a `files` array wins.
    let payload = serde_json::json!({
        "files": files
            .iter()
            .map(|f| serde_json::json!({"name": f.name, "content": f.content}))
            .collect::<Vec<_>>(),
    });
    for result in hooks.emit("agent:bootstrap", payload, ctx).await {
        if let Some(replacement) = result.get("files").and_then(|v| v.as_array()) {
            files = replacement
                .iter()
                .filter_map(|f| {
                    Some(BootstrapFile {
                        name: f.get("name")?.as_str()?.to_owned(),
                        content: f.get("content")?.as_str()?.to_owned(),
                    })
                })
                .collect();
        }
    }

    let mut sections: Vec<String> = Vec::new();
    let mut report_sections: Vec<String> = Vec::new();

    for file in &files {
        if !file.content.trim().is_empty() {
            sections.push(file.content.trim_end().to_owned());
            report_sections.push(format!("bootstrap:{}", file.name));
        }
    }

    let catalog = skills::discover(&config.skills_dir);
    let skills_section = skills::format_skills_section(&catalog);
    if !skills_section.is_empty() {
        sections.push(skills_section);
        report_sections.push(format!("skills:{}", catalog.len()));
    }

    if let Some(suffix) = &config.system_prompt_suffix {
        if !suffix.trim().is_empty() {
            sections.push(suffix.trim().to_owned());
            report_sections.push("suffix".into());
        }
    }

    let report = SystemPromptReport {
        built_at: Some(chrono::Utc::now().timestamp_millis()),
        sections: report_sections,
    };
    (sections.join("\n\n"), report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_until_evicted() {
        let pool = AgentSessions::new();
        let first = pool.get_or_create("s1", "agent:main:main", "main");
        first.lock().messages.push(Message::user("hi"));

        let again = pool.get_or_create("s1", "agent:main:main", "main");
        assert_eq!(again.lock().messages.len(), 1);

        assert!(pool.evict("s1"));
        let fresh = pool.get_or_create("s1", "agent:main:main", "main");
        assert!(fresh.lock().messages.is_empty());
    }

    #[test]
    fn history_respects_limit() {
        let mut session = AgentSession::new("s1", "k", "main");
        for i in 0..5 {
            session.inject(Role::User, format!("m{i}"));
        }
        assert_eq!(session.history(Some(2)).len(), 2);
        assert_eq!(session.history(None).len(), 5);
        assert_eq!(
            session.history(Some(2))[0].content.extract_all_text(),
            "m3"
        );
    }

    #[tokio::test]
    async fn prompt_concatenates_bootstrap_skills_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "Be helpful.").unwrap();
        let skills_dir = dir.path().join("skills");
        std::fs::create_dir_all(skills_dir.join("web")).unwrap();
        std::fs::write(
            skills_dir.join("web/SKILL.md"),
            "---\nname: web\ndescription: fetch\n---\nbody",
        )
        .unwrap();

        let config = AgentConfig {
            workspace_dir: dir.path().to_path_buf(),
            bootstrap_files: vec!["SOUL.md".into()],
            skills_dir,
            system_prompt_suffix: Some("Suffix line.".into()),
            ..Default::default()
        };
        let workspace = WorkspaceReader::new(config.workspace_dir.clone());
        let hooks = HookRegistry::new();

        let (prompt, report) =
            assemble_system_prompt(&config, &workspace, &hooks, &HookContext::default()).await;

        let soul = prompt.find("Be helpful.").unwrap();
        let skills = prompt.find("<available_skills>").unwrap();
        let suffix = prompt.find("Suffix line.").unwrap();
        assert!(soul < skills && skills < suffix);
        assert_eq!(report.sections.len(), 3);
    }

    #[tokio::test]
    async fn bootstrap_hook_can_replace_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "original").unwrap();

        let config = AgentConfig {
            workspace_dir: dir.path().to_path_buf(),
            bootstrap_files: vec!["SOUL.md".into()],
            skills_dir: dir.path().join("no-skills"),
            ..Default::default()
        };
        let workspace = WorkspaceReader::new(config.workspace_dir.clone());
        let hooks = HookRegistry::new();
        hooks.register_fn("agent:bootstrap", |_, _| {
            Ok(Some(serde_json::json!({
                "files": [{"name": "SOUL.md", "content": "rewritten"}]
            })))
        });

        let (prompt, _) =
            assemble_system_prompt(&config, &workspace, &hooks, &HookContext::default()).await;
        assert!(prompt.contains("rewritten"));
        assert!(!prompt.contains("original"));
    }
}
