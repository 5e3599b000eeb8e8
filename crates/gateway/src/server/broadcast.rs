//! Event bus: scope-filtered broadcast fan-out.
//!
//! Both the gateway runtime and the channel manager depend on the bus
//! rather than on each other: WS connections receive frames through their
//! bounded send queues, and internal listeners (outbound delivery, tests)
//! subscribe to a `tokio::sync::broadcast` tap of the same frames.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use ag_protocol::frames::EventFrame;
use ag_protocol::scopes::event_passes_scope_guard;

use super::connection::ConnectionRegistry;
use super::seq::{ReplayBuffer, SeqTracker};

const INTERNAL_TAP_CAPACITY: usize = 1024;

pub struct EventBus {
    pub conns: Arc<ConnectionRegistry>,
    seq: SeqTracker,
    replay: ReplayBuffer,
    tap: broadcast::Sender<EventFrame>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(INTERNAL_TAP_CAPACITY);
        Self {
            conns: Arc::new(ConnectionRegistry::new()),
            seq: SeqTracker::new(),
            replay: ReplayBuffer::new(),
            tap,
        }
    }

    /// Subscribe to every published frame (unfiltered). Used by the
    /// channel manager for outbound delivery and by tests.
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.tap.subscribe()
    }

    /// Publish a topic event. `seq` is monotone per event name.
    pub fn publish(&self, event: &str, payload: Value) {
        let seq = self.seq.next(event);
        let frame = EventFrame { event: event.to_owned(), payload, seq: Some(seq) };
        self.fan_out(frame);
    }

    /// Publish a run-scoped event. `seq` is monotone per run id and the
    /// frame is retained for best-effort replay.
    pub fn publish_run(&self, run_id: &str, event: &str, payload: Value) {
        let seq = self.seq.next(run_id);
        let frame = EventFrame { event: event.to_owned(), payload, seq: Some(seq) };
        self.replay.record(run_id, frame.clone());
        self.fan_out(frame);
    }

    /// Replay frames for a run after `since_seq`, directly to one
    /// connection (bypasses seq assignment — frames keep their numbers).
    /// Returns how many frames were sent; `None` when the window rolled.
    pub fn replay_to(&self, conn_id: &str, run_id: &str, since_seq: u64) -> Option<usize> {
        let frames = self.replay.since(run_id, since_seq)?;
        let conn = self.conns.get(conn_id)?;
        let mut sent = 0;
        for frame in frames {
            if event_passes_scope_guard(&frame.event, &conn.scopes) && conn.try_send(frame) {
                sent += 1;
            }
        }
        Some(sent)
    }

    /// Forget a finished run's sequence and replay state.
    pub fn release_run(&self, run_id: &str) {
        self.seq.reset(run_id);
        self.replay.reset(run_id);
    }

    fn fan_out(&self, frame: EventFrame) {
        // Internal tap first: delivery listeners see frames even with no
        // WS clients connected.
        let _ = self.tap.send(frame.clone());

        for conn in self.conns.all() {
            if !event_passes_scope_guard(&frame.event, &conn.scopes) {
                continue;
            }
            // try_send never blocks: a slow consumer only loses its own
            // frames (and eventually its connection).
            conn.try_send(frame.clone());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::Outbound;

    #[tokio::test]
    async fn scope_filter_applies_per_connection() {
        let bus = EventBus::new();
        let (_reader, mut reader_rx) =
            bus.conns
                .register("reader", "operator", vec!["operator.read".into()]);
        let (_blind, mut blind_rx) = bus.conns.register("blind", "probe", vec![]);

        bus.publish("chat", serde_json::json!({"x": 1}));
        bus.publish("tick", serde_json::json!({}));

        fn event_name(frame: Outbound) -> String {
            match frame {
                Outbound::Event(ef) => ef.event,
                other => panic!("expected Outbound::Event, got {other:?}"),
            }
        }

        // Guarded event reaches only the scoped connection.
        assert_eq!(event_name(reader_rx.recv().await.unwrap()), "chat");
        assert_eq!(event_name(reader_rx.recv().await.unwrap()), "tick");
        // The unscoped connection sees only the unguarded tick.
        assert_eq!(event_name(blind_rx.recv().await.unwrap()), "tick");
        assert!(blind_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_events_have_strictly_increasing_seq() {
        let bus = EventBus::new();
        let mut tap = bus.subscribe();
        for _ in 0..5 {
            bus.publish_run("r1", "chat.delta", serde_json::json!({}));
        }
        let mut last = None;
        for _ in 0..5 {
            let frame = tap.recv().await.unwrap();
            let seq = frame.seq.unwrap();
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        }
    }

    #[tokio::test]
    async fn replay_resends_buffered_frames() {
        let bus = EventBus::new();
        let (_conn, mut rx) =
            bus.conns
                .register("c1", "operator", vec!["operator.read".into()]);

        for i in 0..4 {
            bus.publish_run("r1", "chat.delta", serde_json::json!({"i": i}));
        }
        // Drain the live copies.
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }

        fn seq_of(frame: Outbound) -> Option<u64> {
            match frame {
                Outbound::Event(ef) => ef.seq,
                other => panic!("expected Outbound::Event, got {other:?}"),
            }
        }

        let sent = bus.replay_to("c1", "r1", 1).unwrap();
        assert_eq!(sent, 2);
        assert_eq!(seq_of(rx.recv().await.unwrap()), Some(2));
        assert_eq!(seq_of(rx.recv().await.unwrap()), Some(3));
    }

    #[tokio::test]
    async fn release_run_resets_seq() {
        let bus = EventBus::new();
        bus.publish_run("r1", "chat.delta", serde_json::json!({}));
        bus.release_run("r1");
        let mut tap = bus.subscribe();
        bus.publish_run("r1", "chat.delta", serde_json::json!({}));
        assert_eq!(tap.recv().await.unwrap().seq, Some(0));
    }

    #[tokio::test]
    async fn stalled_connection_does_not_block_others() {
        use super::super::connection::{SEND_QUEUE_CAPACITY, SLOW_CONSUMER_DROP_LIMIT};

        let bus = EventBus::new();
        // Stalled: queue never drained.
        let (stalled, _stalled_rx) =
            bus.conns
                .register("stalled", "operator", vec!["operator.read".into()]);
        let (_healthy, mut healthy_rx) =
            bus.conns
                .register("healthy", "operator", vec!["operator.read".into()]);

        let total = SEND_QUEUE_CAPACITY + SLOW_CONSUMER_DROP_LIMIT as usize;
        for i in 0..total {
            bus.publish("chat", serde_json::json!({"i": i}));
        }

        // The healthy connection got everything it drained for.
        let mut received = 0;
        while healthy_rx.try_recv().is_ok() {
            received += 1;
        }
        // Healthy queue also has capacity limits, but it was never blocked
        // by the stalled peer.
        assert!(received > 0);
        assert!(stalled.is_poisoned());
    }
}
