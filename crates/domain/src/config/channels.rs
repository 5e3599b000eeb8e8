use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel adapters & auto-reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-channel adapter configuration, including the auto-reply pipeline
/// settings that decide which inbound messages trigger turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Bot account ID within the channel.
    #[serde(default = "d_account")]
    pub account_id: String,

    /// Bot display name; used to build default mention patterns.
    #[serde(default)]
    pub bot_name: String,

    /// Sender allow-list for group messages (exact or `*` wildcard).
    /// `None` = no restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_from: Option<Vec<String>>,

    /// Extra mention patterns (regex) beyond `@<bot_name>` / `<bot_name>`.
    #[serde(default)]
    pub mention_patterns: Vec<String>,

    /// Reply to every group message instead of requiring a mention.
    #[serde(default)]
    pub always_group_activation: bool,

    /// Message batching window for rapid messages from the same peer.
    #[serde(default = "d_debounce_ms")]
    pub debounce_ms: u64,

    /// Sliding window for outbound echo detection.
    #[serde(default = "d_echo_window")]
    pub echo_window_secs: u64,

    /// Adapter-specific settings, passed through opaquely at start().
    #[serde(default)]
    pub settings: std::collections::HashMap<String, serde_json::Value>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            account_id: d_account(),
            bot_name: String::new(),
            allow_from: None,
            mention_patterns: Vec::new(),
            always_group_activation: false,
            debounce_ms: d_debounce_ms(),
            echo_window_secs: d_echo_window(),
            settings: std::collections::HashMap::new(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_account() -> String {
    "default".into()
}
fn d_debounce_ms() -> u64 {
    2_000
}
fn d_echo_window() -> u64 {
    30
}
