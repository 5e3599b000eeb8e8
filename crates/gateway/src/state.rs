//! Shared application state passed to the WS handlers, run workers, and
//! background loops.

use std::sync::Arc;

use ag_domain::config::Config;
use ag_llm::LlmClient;
use ag_protocol::device::DeviceStore;
use ag_sessions::{IdentityResolver, LifecycleManager, SessionStore};

use crate::channels::ChannelManager;
use crate::cron::service::CronService;
use crate::hooks::HookRegistry;
use crate::runtime::agents::AgentSessions;
use crate::runtime::chat_queue::ChatQueue;
use crate::runtime::tools::ToolRegistry;
use crate::server::broadcast::EventBus;
use crate::server::dedupe::DedupeCache;
use crate::server::heartbeat::HeartbeatQueue;
use crate::server::presence::PresenceRegistry;
use crate::workspace::{SeedTracker, WorkspaceReader};

/// Shared application state.
///
/// Grouped by concern:
/// - **Core** — config, session store, identity links, device store
/// - **Fabric** — event bus, dedupe cache, presence, heartbeat
/// - **Runtime** — agent pool, chat queue, tools, hooks, LLM client
/// - **Services** — cron, channel manager, workspace
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub identity: Arc<IdentityResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub devices: Arc<DeviceStore>,

    // ── Fabric ────────────────────────────────────────────────────────
    pub bus: Arc<EventBus>,
    pub dedupe: Arc<DedupeCache>,
    pub presence: Arc<PresenceRegistry>,
    pub heartbeat: Arc<HeartbeatQueue>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub agents: Arc<AgentSessions>,
    pub chat: Arc<ChatQueue>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub llm: Arc<dyn LlmClient>,

    // ── Services ──────────────────────────────────────────────────────
    pub cron: Arc<CronService>,
    pub channels: Arc<ChannelManager>,
    pub workspace: Arc<WorkspaceReader>,
    pub seeds: Arc<SeedTracker>,
}

impl AppState {
    /// Agent id embedded in a session key (`agent:<id>:…`), or the
    /// configured default for synthetic keys (`cron:<job>:<uuid>`).
    pub fn agent_id_for_key(&self, session_key: &str) -> String {
        let mut parts = session_key.splitn(3, ':');
        match (parts.next(), parts.next()) {
            (Some("agent"), Some(agent_id)) if !agent_id.is_empty() => agent_id.to_owned(),
            _ => self.config.session.default_agent.clone(),
        }
    }
}
