//! Canonical session keys.
//!
//! Key templates:
//! - `agent:<agentId>:main`
//! - `agent:<agentId>:dm:<peerId>`
//! - `agent:<agentId>:group:<channel>:<peerId>`
//! - `agent:<agentId>:thread:<channel>:<peerId>:<threadId>`
//!
//! The peer portion is case-insensitive and always normalized to
//! lowercase, so routing inputs differing only in peer-id case land on
//! the same session.

/// The scope half of a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    Main,
    Dm { peer_id: String },
    Group { channel: String, peer_id: String },
    Thread {
        channel: String,
        peer_id: String,
        thread_id: String,
    },
}

impl SessionScope {
    fn render(&self) -> String {
        match self {
            SessionScope::Main => "main".into(),
            SessionScope::Dm { peer_id } => format!("dm:{}", normalize(peer_id)),
            SessionScope::Group { channel, peer_id } => {
                format!("group:{}:{}", channel, normalize(peer_id))
            }
            SessionScope::Thread { channel, peer_id, thread_id } => {
                format!("thread:{}:{}:{}", channel, normalize(peer_id), thread_id)
            }
        }
    }
}

/// Compute the canonical session key for an agent and scope.
pub fn session_key(agent_id: &str, scope: &SessionScope) -> String {
    format!("agent:{}:{}", agent_id, scope.render())
}

fn normalize(peer_id: &str) -> String {
    peer_id.to_lowercase()
}
