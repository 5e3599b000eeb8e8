//! Routing engine — maps an inbound (channel, account, peer) to an agent
//! and canonical session key.
//!
//! Precedence:
//! 1. Peer bindings (exact configuration matches; omitted `peer_id`
//!    matches any peer with the given channel/kind).
//! 2. Identity links (normalized lookup substituting a canonical peer id).
//! 3. Default scope per `session.dm_scope`.

use ag_domain::config::{Config, DmScope, Peer, PeerKind};
use ag_domain::trace::TraceEvent;

use crate::identity::IdentityResolver;
use crate::session_key::{session_key, SessionScope};

/// Inputs to route resolution, taken from one inbound message.
#[derive(Debug, Clone)]
pub struct RouteInput {
    pub channel: String,
    pub account_id: String,
    pub peer: Peer,
    /// Present when the message arrived inside a thread.
    pub thread_id: Option<String>,
}

/// Which rule produced the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    PeerBinding,
    IdentityLink,
    Default,
}

impl MatchedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchedBy::PeerBinding => "binding.peer",
            MatchedBy::IdentityLink => "identity_link",
            MatchedBy::Default => "default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub agent_id: String,
    pub session_key: String,
    pub matched_by: MatchedBy,
}

/// Resolve the agent and session key for one inbound message.
pub fn resolve_agent_route(
    config: &Config,
    identity: &IdentityResolver,
    input: &RouteInput,
) -> ResolvedRoute {
    // 1. Peer bindings: first exact match wins.
    let binding = config.session.bindings.iter().find(|b| {
        b.channel == input.channel
            && b.peer_kind == input.peer.kind
            && b.account_id
                .as_deref()
                .map_or(true, |acct| acct == input.account_id)
            && b.peer_id
                .as_deref()
                .map_or(true, |pid| pid.eq_ignore_ascii_case(&input.peer.id))
    });

    let (agent_id, peer_id, matched_by) = match binding {
        Some(binding) => (
            binding.agent_id.clone(),
            input.peer.id.clone(),
            MatchedBy::PeerBinding,
        ),
        None => {
            // 2. Identity links substitute the canonical peer id.
            match identity.resolve(&input.channel, &input.peer.id) {
                Some(canonical) => (
                    config.session.default_agent.clone(),
                    canonical,
                    MatchedBy::IdentityLink,
                ),
                None => (
                    config.session.default_agent.clone(),
                    input.peer.id.clone(),
                    MatchedBy::Default,
                ),
            }
        }
    };

    // 3. Scope per peer kind and configured dm_scope. Groups always
    //    isolate by channel+peer regardless of dm_scope.
    let scope = match input.peer.kind {
        PeerKind::Dm => match config.session.dm_scope {
            DmScope::Main => SessionScope::Main,
            DmScope::PerPeer => SessionScope::Dm { peer_id },
        },
        PeerKind::Group => SessionScope::Group {
            channel: input.channel.clone(),
            peer_id,
        },
        PeerKind::Thread => match &input.thread_id {
            Some(thread_id) => SessionScope::Thread {
                channel: input.channel.clone(),
                peer_id,
                thread_id: thread_id.clone(),
            },
            // A thread message without a thread id falls back to the
            // containing group scope.
            None => SessionScope::Group {
                channel: input.channel.clone(),
                peer_id,
            },
        },
    };

    let key = session_key(&agent_id, &scope);
    TraceEvent::RouteResolved {
        channel: input.channel.clone(),
        peer_id: input.peer.id.clone(),
        session_key: key.clone(),
        matched_by: matched_by.as_str().to_owned(),
    }
    .emit();

    ResolvedRoute { agent_id, session_key: key, matched_by }
}
