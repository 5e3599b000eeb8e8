//! Identity linking — collapse the same person across channels.
//!
//! Maps many raw peer IDs to one canonical identity so "Alice on Telegram"
//! and "Alice on Discord" share the same DM session when desired.
//!
//! Lookups are case-insensitive and try both the bare peer id and the
//! channel-prefixed form (`telegram:123`).

use std::collections::HashMap;
use std::path::Path;

use ag_domain::config::IdentityLink;
use ag_domain::trace::TraceEvent;

/// Resolves raw peer IDs to canonical identities.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    /// lowercased peer id → canonical
    map: HashMap<String, String>,
}

impl IdentityResolver {
    /// Build a resolver from configured identity links.
    pub fn from_config(links: &[IdentityLink]) -> Self {
        let mut map = HashMap::new();
        for link in links {
            for pid in &link.peer_ids {
                map.insert(pid.to_lowercase(), link.canonical.clone());
            }
        }
        Self { map }
    }

    /// Merge links from the optional `identity_links.json` file on top of
    /// the config-derived map. File entries win on conflict.
    pub fn with_file(mut self, path: &Path) -> Self {
        if !path.exists() {
            return self;
        }
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "identity links file unreadable");
                return self;
            }
        };
        match serde_json::from_str::<HashMap<String, Vec<String>>>(&raw) {
            Ok(file_links) => {
                for (canonical, peer_ids) in file_links {
                    for pid in peer_ids {
                        self.map.insert(pid.to_lowercase(), canonical.clone());
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "identity links file invalid");
            }
        }
        self
    }

    /// Resolve a raw peer ID within a channel. Tries `<peer>` then
    /// `<channel>:<peer>`; returns `None` when no link matches.
    pub fn resolve(&self, channel: &str, raw_peer_id: &str) -> Option<String> {
        let peer = raw_peer_id.to_lowercase();
        let canonical = self
            .map
            .get(&peer)
            .or_else(|| self.map.get(&format!("{}:{}", channel, peer)))?;
        TraceEvent::IdentityResolved {
            raw_peer_id: raw_peer_id.to_owned(),
            canonical: canonical.clone(),
        }
        .emit();
        Some(canonical.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
