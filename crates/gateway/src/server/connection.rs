//! Connection registry.
//!
//! Each WebSocket client gets a [`ConnectionHandle`] holding its scope set
//! and a bounded send queue drained by a writer task. The broadcast fabric
//! holds only the registry; a handle is dropped from it the moment its
//! socket closes.
//!
//! Slow consumers: a full send queue increments the connection's `dropped`
//! counter; past [`SLOW_CONSUMER_DROP_LIMIT`] the connection is
//! force-closed so one stalled client cannot back-pressure the gateway.
//! The close signal rides a separate one-shot flag, not the (full) queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use ag_domain::trace::TraceEvent;
use ag_domain::CancelToken;
use ag_protocol::frames::{EventFrame, ResponseFrame};

/// Send-queue capacity per connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Dropped-frame budget before a stalled connection is force-closed.
pub const SLOW_CONSUMER_DROP_LIMIT: u64 = 64;

/// Messages drained by a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(EventFrame),
    Response(ResponseFrame),
    /// WS-level keepalive ping.
    Ping,
}

/// One live, authenticated connection.
pub struct ConnectionHandle {
    pub conn_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    sender: mpsc::Sender<Outbound>,
    /// Set when the connection must be force-closed (`slow_consumer`).
    close: CancelToken,
    dropped: AtomicU64,
}

impl ConnectionHandle {
    /// Try to enqueue an event without waiting. Returns `false` when the
    /// frame was dropped (queue full or socket gone).
    pub fn try_send(&self, frame: EventFrame) -> bool {
        match self.sender.try_send(Outbound::Event(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == SLOW_CONSUMER_DROP_LIMIT {
                    TraceEvent::SlowConsumerClosed {
                        conn_id: self.conn_id.clone(),
                        dropped,
                    }
                    .emit();
                    self.close.cancel();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an RPC response. Waits for queue space — responses are never
    /// dropped under broadcast pressure.
    pub async fn send_response(&self, frame: ResponseFrame) -> bool {
        self.sender.send(Outbound::Response(frame)).await.is_ok()
    }

    /// Queue a WS-level keepalive ping.
    pub async fn send_ping(&self) -> bool {
        self.sender.send(Outbound::Ping).await.is_ok()
    }

    /// Token the writer task watches to force-close the socket.
    pub fn close_token(&self) -> CancelToken {
        self.close.clone()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether this connection exhausted its slow-consumer budget.
    pub fn is_poisoned(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Registry of live connections keyed by conn id.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection; returns its handle and the
    /// receiver its writer task drains.
    pub fn register(
        &self,
        conn_id: &str,
        role: &str,
        scopes: Vec<String>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let handle = Arc::new(ConnectionHandle {
            conn_id: conn_id.to_owned(),
            role: role.to_owned(),
            scopes,
            sender: tx,
            close: CancelToken::new(),
            dropped: AtomicU64::new(0),
        });
        self.conns
            .write()
            .insert(conn_id.to_owned(), handle.clone());
        (handle, rx)
    }

    pub fn remove(&self, conn_id: &str) {
        self.conns.write().remove(conn_id);
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.conns.read().get(conn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Snapshot of the live handles, for fan-out iteration.
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.conns.read().values().cloned().collect()
    }
}
