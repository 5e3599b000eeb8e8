//! Per-run event sequence tracking and the best-effort replay buffer.
//!
//! Every event carries `seq` — the next integer for its run id or topic,
//! starting at 0. Receivers detect gaps and may ask for replay with the
//! last seq they saw; replay is served from a bounded per-run ring.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use ag_protocol::frames::EventFrame;

/// Frames retained per run for replay.
pub const REPLAY_BUFFER_CAP: usize = 256;

/// Assigns monotone sequence numbers per key (run id or topic).
#[derive(Default)]
pub struct SeqTracker {
    seq: Mutex<HashMap<String, u64>>,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number for a key (0-indexed).
    pub fn next(&self, key: &str) -> u64 {
        let mut seq = self.seq.lock();
        let entry = seq.entry(key.to_owned()).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    }

    /// Current (last assigned) sequence for a key, if any.
    pub fn current(&self, key: &str) -> Option<u64> {
        self.seq.lock().get(key).map(|next| next.saturating_sub(1))
    }

    /// Forget a finished run.
    pub fn reset(&self, key: &str) {
        self.seq.lock().remove(key);
    }

    /// Bound the tracker when many runs have come and gone. Keeps the
    /// entries with the highest sequence numbers.
    pub fn prune(&self, max_entries: usize) -> usize {
        let mut seq = self.seq.lock();
        if seq.len() <= max_entries {
            return 0;
        }
        let mut items: Vec<_> = seq.drain().collect();
        items.sort_by(|a, b| b.1.cmp(&a.1));
        let removed = items.len() - max_entries;
        items.truncate(max_entries);
        *seq = items.into_iter().collect();
        removed
    }
}

/// Ring of recent frames per run, serving `event.replay`.
#[derive(Default)]
pub struct ReplayBuffer {
    frames: Mutex<HashMap<String, VecDeque<EventFrame>>>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: &str, frame: EventFrame) {
        let mut frames = self.frames.lock();
        let ring = frames.entry(run_id.to_owned()).or_default();
        if ring.len() == REPLAY_BUFFER_CAP {
            ring.pop_front();
        }
        ring.push_back(frame);
    }

    /// Frames with `seq > since_seq`, if that range is still buffered.
    /// `None` means the window has already rolled past the request.
    pub fn since(&self, run_id: &str, since_seq: u64) -> Option<Vec<EventFrame>> {
        let frames = self.frames.lock();
        let ring = frames.get(run_id)?;
        let oldest = ring.front().and_then(|f| f.seq)?;
        // A gap older than the buffer cannot be replayed.
        if since_seq + 1 < oldest {
            return None;
        }
        Some(
            ring.iter()
                .filter(|f| f.seq.is_some_and(|s| s > since_seq))
                .cloned()
                .collect(),
        )
    }

    /// Drop a finished run's ring.
    pub fn reset(&self, run_id: &str) {
        self.frames.lock().remove(run_id);
    }
}
