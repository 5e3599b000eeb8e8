use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how inbound messages map to session keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Agent that handles unbound traffic.
    #[serde(default = "d_default_agent")]
    pub default_agent: String,

    /// DM scoping strategy.
    #[serde(default)]
    pub dm_scope: DmScope,

    /// Exact-match peer bindings, checked before identity links.
    #[serde(default)]
    pub bindings: Vec<PeerBinding>,

    /// Collapse the same human across channels into one canonical identity.
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,

    /// Session reset rules (daily boundary, idle timeout).
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_agent: d_default_agent(),
            dm_scope: DmScope::default(),
            bindings: Vec::new(),
            identity_links: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Session lifecycle rules. A stale session is reset (fresh session id,
/// zeroed counters) on the next inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LifecycleConfig {
    /// Daily reset hour (0–23, gateway-local UTC). `None` disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_reset_hour: Option<u8>,

    /// Idle timeout in minutes. `None` disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u32>,

    /// Per-kind overrides (keys: `"dm"`, `"group"`, `"thread"`).
    #[serde(default)]
    pub reset_by_kind: HashMap<String, ResetOverride>,

    /// Per-channel overrides; take precedence over per-kind.
    #[serde(default)]
    pub reset_by_channel: HashMap<String, ResetOverride>,
}

/// Override fields for per-kind or per-channel lifecycle rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_reset_hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u32>,
}

/// How DM sessions are scoped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmScope {
    /// `agent:<agentId>:main` — one shared DM session.
    Main,
    /// `agent:<agentId>:dm:<peerId>` — isolated per peer.
    #[default]
    PerPeer,
}

/// The other side of a channel conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Dm,
    Group,
    Thread,
}

impl PeerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerKind::Dm => "dm",
            PeerKind::Group => "group",
            PeerKind::Thread => "thread",
        }
    }
}

/// An exact configuration match routing a peer to a specific agent.
/// Omitting `peer_id` matches any peer with the given channel/kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerBinding {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub peer_kind: PeerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub agent_id: String,
}

/// Maps many raw peer IDs to one canonical identity so "Alice on Telegram"
/// and "Alice on Discord" share the same DM session.
///
/// Peer IDs should be prefixed: `telegram:123`, `discord:987`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLink {
    /// The canonical identity key (e.g. `"alice"`).
    pub canonical: String,
    /// Raw peer IDs that all resolve to `canonical`.
    pub peer_ids: Vec<String>,
}

fn d_default_agent() -> String {
    "main".into()
}
