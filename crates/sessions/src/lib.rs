//! Session identity for the gateway: canonical session keys, the routing
//! engine that maps inbound peers to agents, identity links, and the
//! persisted session store.

pub mod identity;
pub mod lifecycle;
pub mod routing;
pub mod session_key;
pub mod store;

pub use identity::IdentityResolver;
pub use lifecycle::{LifecycleManager, ResetReason};
pub use routing::{resolve_agent_route, MatchedBy, ResolvedRoute, RouteInput};
pub use session_key::{session_key, SessionScope};
pub use store::{DeliveryContext, SessionEntry, SessionPatch, SessionStore};
