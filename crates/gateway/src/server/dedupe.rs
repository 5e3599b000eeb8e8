//! Idempotency cache for RPC results.
//!
//! Keyed by `(method, idempotency_key)`. A retried request inside the TTL
//! returns the cached response without re-executing. Expired entries are
//! lazily removed on read and actively pruned when capacity is exceeded
//! (oldest first).

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use ag_protocol::frames::ErrorShape;

pub const DEDUPE_TTL_MS: i64 = 60_000;
pub const DEDUPE_MAX: usize = 1000;

/// Cached outcome of one idempotent RPC.
#[derive(Debug, Clone)]
pub struct DedupeEntry {
    pub ts_ms: i64,
    pub ok: bool,
    pub payload: Option<Value>,
    pub error: Option<ErrorShape>,
}

pub struct DedupeCache {
    ttl_ms: i64,
    max_entries: usize,
    cache: Mutex<HashMap<String, DedupeEntry>>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::with_limits(DEDUPE_TTL_MS, DEDUPE_MAX)
    }

    pub fn with_limits(ttl_ms: i64, max_entries: usize) -> Self {
        Self {
            ttl_ms,
            max_entries,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(method: &str, idempotency_key: &str) -> String {
        format!("{method}\u{1f}{idempotency_key}")
    }

    /// Cached result for a key, unless expired.
    pub fn get(&self, method: &str, idempotency_key: &str) -> Option<DedupeEntry> {
        let key = Self::cache_key(method, idempotency_key);
        let mut cache = self.cache.lock();
        let entry = cache.get(&key)?;
        if now_ms() - entry.ts_ms > self.ttl_ms {
            cache.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    /// Record a success.
    pub fn put_ok(&self, method: &str, idempotency_key: &str, payload: Value) {
        self.put(method, idempotency_key, DedupeEntry {
            ts_ms: now_ms(),
            ok: true,
            payload: Some(payload),
            error: None,
        });
    }

    /// Record a failure (retries get the same error back).
    pub fn put_err(&self, method: &str, idempotency_key: &str, error: ErrorShape) {
        self.put(method, idempotency_key, DedupeEntry {
            ts_ms: now_ms(),
            ok: false,
            payload: None,
            error: Some(error),
        });
    }

    fn put(&self, method: &str, idempotency_key: &str, entry: DedupeEntry) {
        let key = Self::cache_key(method, idempotency_key);
        let mut cache = self.cache.lock();
        cache.insert(key, entry);
        if cache.len() > self.max_entries {
            Self::cleanup(&mut cache, self.ttl_ms, self.max_entries);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    fn cleanup(cache: &mut HashMap<String, DedupeEntry>, ttl_ms: i64, max_entries: usize) {
        let now = now_ms();
        cache.retain(|_, entry| now - entry.ts_ms <= ttl_ms);

        if cache.len() > max_entries {
            let mut by_age: Vec<(String, i64)> = cache
                .iter()
                .map(|(k, e)| (k.clone(), e.ts_ms))
                .collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            let excess = cache.len() - max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                cache.remove(&key);
            }
        }
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
