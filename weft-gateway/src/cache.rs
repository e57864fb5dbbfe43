//! In-memory response cache: TTL per entry, LRU eviction at capacity.
//!
//! Keys are `service:method:path:query:varyHeaders`; the sweep task drops
//! expired entries on an interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
    last_used: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Build the canonical cache key for a request.
    pub fn key(
        service: &str,
        method: &str,
        path: &str,
        query: &str,
        vary_values: &[String],
    ) -> String {
        format!("{service}:{method}:{path}:{query}:{}", vary_values.join(","))
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, response: CachedResponse, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache poisoned");
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Evict the least recently used entry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: now + ttl,
                last_used: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("cache poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn spawn_sweep(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => cache.sweep(),
                }
            }
        })
    }
}
