//! Heartbeat ticks and the next-heartbeat wake queue.
//!
//! A periodic `tick` event (unguarded) anchors client keepalive. Wake
//! texts queued with `mode = "next_heartbeat"` are drained into
//! `system.event` broadcasts on the next tick; `mode = "now"` publishes
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::broadcast::EventBus;

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeMode {
    Now,
    NextHeartbeat,
}

#[derive(Default)]
pub struct HeartbeatQueue {
    pending: Mutex<Vec<String>>,
}

impl HeartbeatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue or immediately publish a wake text.
    pub fn wake(&self, bus: &EventBus, text: String, mode: WakeMode) {
        match mode {
            WakeMode::Now => publish_system_event(bus, &text),
            WakeMode::NextHeartbeat => self.pending.lock().push(text),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// One tick: publish `tick`, then drain queued wakes.
    pub fn tick(&self, bus: &EventBus) {
        bus.publish(
            "tick",
            serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() }),
        );
        let drained: Vec<String> = std::mem::take(&mut *self.pending.lock());
        for text in drained {
            publish_system_event(bus, &text);
        }
    }

    /// Spawn the periodic tick loop.
    pub fn start(self: Arc<Self>, bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let queue = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            // The immediate first tick would fire before any client has
            // connected; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                queue.tick(&bus);
            }
        })
    }
}

fn publish_system_event(bus: &EventBus, text: &str) {
    bus.publish("system.event", serde_json::json!({ "text": text }));
}
