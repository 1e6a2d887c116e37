//! Routing result cache
//!
//! A bounded LRU map from request fingerprint to [`RouteResult`], with a
//! time-to-live per entry. Expired entries are dropped when they are looked
//! up and otherwise age out through LRU eviction.

use crate::context::RouteResult;
use lru::LruCache;
use serde_json::{Value, json};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use switchboard_core::RouteRequest;
use tokio::time::Instant;

struct CacheEntry {
    result: RouteResult,
    inserted: Instant,
}

/// Thread-safe LRU + TTL cache of routing results
pub struct RouteCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl RouteCache {
    /// Create a cache holding at most `max_size` results (minimum 1)
    ///
    /// A zero `ttl` disables expiry.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up a fresh result, refreshing its recency
    pub fn get(&self, key: &str) -> Option<RouteResult> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let expired = match entries.get(key) {
            Some(entry) if !self.is_expired(entry) => return Some(entry.result.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            tracing::debug!("Routing cache entry expired");
        }
        None
    }

    /// Store a result, evicting the least recently used entry when full
    pub fn insert(&self, key: String, result: RouteResult) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.put(
            key,
            CacheEntry {
                result,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Number of stored entries, including ones that expired but were not looked up yet
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cap()
            .get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        !self.ttl.is_zero() && entry.inserted.elapsed() >= self.ttl
    }
}

impl std::fmt::Debug for RouteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Cache key for a routing decision
///
/// Covers the requested model, the resolved route, the token count, whether
/// tools and a system prompt are present, the thinking flag and the session.
pub fn fingerprint(request: &RouteRequest, token_count: u64, route: &str) -> String {
    json!({
        "model": request.model(),
        "route": route,
        "token_count": token_count,
        "has_tools": request.has_tools(),
        "has_system": request.has_system(),
        "thinking": request.thinking().cloned().unwrap_or(Value::Bool(false)),
        "session_id": request.session_id,
    })
    .to_string()
}
