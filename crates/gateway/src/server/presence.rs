//! Presence tracking — roster of connected clients.
//!
//! Updated on connect/disconnect; each change broadcasts a `presence`
//! event (scope `operator.read`) with the full roster.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::broadcast::EventBus;

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub conn_id: String,
    pub client_name: String,
    pub client_version: String,
    pub platform: String,
    pub auth_method: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    clients: RwLock<HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joined(&self, entry: PresenceEntry, bus: &EventBus) {
        self.clients
            .write()
            .insert(entry.conn_id.clone(), entry);
        self.broadcast(bus);
    }

    pub fn left(&self, conn_id: &str, bus: &EventBus) {
        if self.clients.write().remove(conn_id).is_some() {
            self.broadcast(bus);
        }
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut roster: Vec<_> = self.clients.read().values().cloned().collect();
        roster.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        roster
    }

    fn broadcast(&self, bus: &EventBus) {
        let roster = self.roster();
        bus.publish(
            "presence",
            serde_json::json!({ "clients": roster, "count": roster.len() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conn_id: &str) -> PresenceEntry {
        PresenceEntry {
            conn_id: conn_id.into(),
            client_name: "tui".into(),
            client_version: "1.0".into(),
            platform: "linux".into(),
            auth_method: "TOKEN".into(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn join_and_leave_broadcast_roster() {
        let bus = EventBus::new();
        let mut tap = bus.subscribe();
        let presence = PresenceRegistry::new();

        presence.joined(entry("c1"), &bus);
        let frame = tap.recv().await.unwrap();
        assert_eq!(frame.event, "presence");
        assert_eq!(frame.payload["count"], 1);

        presence.left("c1", &bus);
        let frame = tap.recv().await.unwrap();
        assert_eq!(frame.payload["count"], 0);
    }

    #[tokio::test]
    async fn leaving_unknown_conn_is_silent() {
        let bus = EventBus::new();
        let mut tap = bus.subscribe();
        let presence = PresenceRegistry::new();
        presence.left("ghost", &bus);
        assert!(tap.try_recv().is_err());
    }
}
