use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_provider")]
    pub model_provider: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f32,

    /// Workspace directory containing bootstrap files and skills.
    #[serde(default = "d_workspace")]
    pub workspace_dir: PathBuf,

    /// Bootstrap files injected into the system prompt, in order.
    /// Content is opaque to the gateway core.
    #[serde(default = "d_bootstrap_files")]
    pub bootstrap_files: Vec<String>,

    /// Directory of installable skills (one subdirectory per skill).
    #[serde(default = "d_skills_dir")]
    pub skills_dir: PathBuf,

    /// Trailing user-supplied system prompt override, appended last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_suffix: Option<String>,

    /// Maximum sub-agent spawn depth (0 = main). Hard cap 8:
    /// `Config::validate` only warns about larger values; the clamp is
    /// applied where spawn requests are checked (ag-gateway's
    /// `sessions.spawn` handler).
    #[serde(default = "d_spawn_depth")]
    pub max_spawn_depth: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model_provider: d_provider(),
            model: d_model(),
            max_tokens: d_max_tokens(),
            temperature: d_temperature(),
            workspace_dir: d_workspace(),
            bootstrap_files: d_bootstrap_files(),
            skills_dir: d_skills_dir(),
            system_prompt_suffix: None,
            max_spawn_depth: d_spawn_depth(),
        }
    }
}

fn d_provider() -> String {
    "anthropic".into()
}
fn d_model() -> String {
    "claude-sonnet-4".into()
}
fn d_max_tokens() -> u32 {
    8192
}
fn d_temperature() -> f32 {
    0.2
}
fn d_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_bootstrap_files() -> Vec<String> {
    vec!["SOUL.md".into(), "INSTRUCTIONS.md".into(), "HOOKS.md".into()]
}
fn d_skills_dir() -> PathBuf {
    PathBuf::from("./workspace/skills")
}
fn d_spawn_depth() -> u8 {
    8
}
