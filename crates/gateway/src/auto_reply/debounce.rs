//! Message debouncing — batches rapid messages from the same peer so a
//! burst becomes one turn instead of several.
//!
//! Each new message appends to the peer's pending batch and resets the
//! timer (epoch counter: stale timers see a newer epoch and do nothing).
//! When the timer fires, the whole batch is handed to the callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2_000);

type Callback<T> = Arc<dyn Fn(String, Vec<T>) + Send + Sync>;

pub struct MessageDebouncer<T> {
    interval: Duration,
    pending: Arc<Mutex<HashMap<String, Batch<T>>>>,
    callback: Callback<T>,
}

struct Batch<T> {
    items: Vec<T>,
    epoch: u64,
}

impl<T: Send + 'static> MessageDebouncer<T> {
    pub fn new(
        interval: Duration,
        callback: impl Fn(String, Vec<T>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            interval,
            pending: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(callback),
        }
    }

    /// Add a message to the peer's batch and (re)start its timer.
    pub fn add(&self, peer_id: &str, item: T) {
        if peer_id.is_empty() {
            return;
        }

        let epoch = {
            let mut pending = self.pending.lock();
            let batch = pending
                .entry(peer_id.to_owned())
                .or_insert_with(|| Batch { items: Vec::new(), epoch: 0 });
            batch.items.push(item);
            batch.epoch += 1;
            batch.epoch
        };

        let pending = self.pending.clone();
        let callback = self.callback.clone();
        let interval = self.interval;
        let peer = peer_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let batch = {
                let mut map = pending.lock();
                match map.get(&peer) {
                    // A newer message restarted the timer; this one is stale.
                    Some(batch) if batch.epoch != epoch => None,
                    Some(_) => map.remove(&peer),
                    None => None,
                }
            };
            if let Some(batch) = batch {
                if !batch.items.is_empty() {
                    callback(peer, batch.items);
                }
            }
        });
    }

    /// Deliver a peer's pending batch immediately.
    pub fn flush(&self, peer_id: &str) {
        let batch = self.pending.lock().remove(peer_id);
        if let Some(batch) = batch {
            if !batch.items.is_empty() {
                (self.callback)(peer_id.to_owned(), batch.items);
            }
        }
    }

    /// Deliver everything pending (shutdown path).
    pub fn flush_all(&self) {
        let peers: Vec<String> = self.pending.lock().keys().cloned().collect();
        for peer in peers {
            self.flush(&peer);
        }
    }

    pub fn pending_count(&self, peer_id: &str) -> usize {
        self.pending
            .lock()
            .get(peer_id)
            .map_or(0, |batch| batch.items.len())
    }
}
