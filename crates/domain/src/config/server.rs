use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server & auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,

    /// Authentication settings for non-loopback connections.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Directory holding the Control UI static bundle. Served at `/` when
    /// the directory exists; `/` upgrades to WS otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_ui_dir: Option<PathBuf>,

    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            auth: AuthConfig::default(),
            control_ui_dir: None,
            cors: CorsConfig::default(),
        }
    }
}

/// How non-loopback clients authenticate. Loopback connections always
/// bypass auth (`LOCAL_DIRECT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Environment variable holding the shared token (`mode = "token"`).
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Environment variable holding the password (`mode = "password"`).
    #[serde(default = "d_password_env")]
    pub password_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token_env: d_token_env(),
            password_env: d_password_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    Password,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins for the Control UI. A trailing `:*` wildcard matches
    /// any port on that host.
    #[serde(default = "d_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: d_origins() }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    9800
}
fn d_token_env() -> String {
    "AGENTGATE_TOKEN".into()
}
fn d_password_env() -> String {
    "AGENTGATE_PASSWORD".into()
}
fn d_origins() -> Vec<String> {
    vec!["http://localhost:*".into()]
}
