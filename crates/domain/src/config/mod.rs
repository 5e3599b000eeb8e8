mod agent;
mod channels;
mod cron;
mod server;
mod session;

pub use agent::*;
pub use channels::*;
pub use cron::*;
pub use server::*;
pub use session::*;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub cron: CronConfig,
    /// Channel adapter configs (key = channel name: "telegram", "discord", …).
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

impl Config {
    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Validate the configuration, returning all issues found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "port must be non-zero"));
        }
        if self.session.default_agent.is_empty() {
            issues.push(ConfigIssue::error(
                "session.default_agent",
                "default agent id must not be empty",
            ));
        }
        for (i, binding) in self.session.bindings.iter().enumerate() {
            if binding.channel.is_empty() {
                issues.push(ConfigIssue::error(
                    format!("session.bindings[{i}].channel"),
                    "binding channel must not be empty",
                ));
            }
            if binding.agent_id.is_empty() {
                issues.push(ConfigIssue::error(
                    format!("session.bindings[{i}].agent_id"),
                    "binding agent id must not be empty",
                ));
            }
        }
        for link in &self.session.identity_links {
            if link.canonical.is_empty() {
                issues.push(ConfigIssue::error(
                    "session.identity_links",
                    "identity link canonical id must not be empty",
                ));
            }
        }
        if self.agent.max_spawn_depth > 8 {
            issues.push(ConfigIssue::warning(
                "agent.max_spawn_depth",
                "spawn depth above 8 is not supported; clamping to 8",
            ));
        }
        for (name, channel) in &self.channels {
            if channel.debounce_ms == 0 {
                issues.push(ConfigIssue::warning(
                    format!("channels.{name}.debounce_ms"),
                    "debounce of 0 delivers every message as its own turn",
                ));
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root of persisted gateway state (sessions/, cron/, devices.json, …).
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { state_dir: d_state_dir() }
    }
}

fn d_state_dir() -> PathBuf {
    PathBuf::from("./data/state")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }
    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_clean() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn empty_default_agent_is_an_error() {
        let mut config = Config::default();
        config.session.default_agent = String::new();
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn minimal_toml_parses() {
        let raw = r#"
            [server]
            port = 9100

            [session]
            default_agent = "main"
            dm_scope = "per_peer"

            [channels.telegram]
            bot_name = "clawd"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.session.dm_scope, DmScope::PerPeer);
        assert_eq!(config.channels["telegram"].bot_name, "clawd");
    }
}
