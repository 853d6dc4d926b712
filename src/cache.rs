//! In-memory LRU-by-expiry completion cache (§3 `CacheEntry`, §4.2).
//!
//! Grounded on `llm_provider/base.py::CacheManager`: a bounded map keyed by the request
//! fingerprint, evicting the entry with the smallest (earliest) expiry when at capacity.
//! `get` always drops expired entries before reporting a miss, matching §3's invariant.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::provider::CompletionResponse;

struct CacheEntry {
    response: CompletionResponse,
    expiry: Instant,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Safe for concurrent callers via an internal `Mutex` (§5 "mutated under internal
/// synchronisation"); `get` never returns a partially written entry because the whole
/// read-or-evict sequence happens while the lock is held.
pub struct Cache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl Cache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            max_size,
        }
    }

    /// Returns a deep copy of the stored response with `cached=true`, or `None` on miss.
    /// Expired entries are evicted as part of the lookup rather than lazily swept.
    pub fn get(&self, key: &str) -> Option<CompletionResponse> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        let hit = match inner.entries.get(key) {
            Some(entry) if entry.expiry > now => Some(entry.response.clone()),
            Some(_) => None,
            None => None,
        };
        match hit {
            Some(mut response) => {
                inner.hits += 1;
                response.cached = true;
                Some(response)
            }
            None => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert `response` with `expiry = now + ttl`. Evicts the smallest-expiry entry first if
    /// at capacity (§4.2 "evict the entry with the smallest expiry").
    pub fn set(&self, key: String, response: CompletionResponse, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&key) {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expiry)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                response,
                expiry: Instant::now() + ttl,
            },
        );
    }

    /// `hits / (hits + misses)`; `0.0` before any lookup has happened (§4.2).
    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokenUsage;

    fn dummy_response() -> CompletionResponse {
        CompletionResponse {
            content: "2".to_string(),
            model: "alpha".to_string(),
            provider: "openai".to_string(),
            usage: TokenUsage::new(5, 1, 0.00003),
            finish_reason: Some("stop".to_string()),
            function_call: None,
            request_id: None,
            latency_ms: None,
            cached: false,
            effective_max_completion: None,
        }
    }

    #[test]
    fn hit_after_set_reports_cached_true() {
        let cache = Cache::new(10);
        assert!(cache.get("k").is_none());
        cache.set("k".to_string(), dummy_response(), Duration::from_secs(60));
        let hit = cache.get("k").unwrap();
        assert!(hit.cached);
        assert_eq!(hit.content, "2");
    }

    #[test]
    fn expired_entry_reports_miss_and_is_evicted() {
        let cache = Cache::new(10);
        cache.set("k".to_string(), dummy_response(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn evicts_smallest_expiry_when_at_capacity() {
        let cache = Cache::new(2);
        cache.set("a".to_string(), dummy_response(), Duration::from_secs(1));
        cache.set("b".to_string(), dummy_response(), Duration::from_secs(100));
        cache.set("c".to_string(), dummy_response(), Duration::from_secs(100));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn hit_rate_tracks_hits_over_total() {
        let cache = Cache::new(10);
        assert_eq!(cache.hit_rate(), 0.0);
        cache.set("k".to_string(), dummy_response(), Duration::from_secs(60));
        cache.get("k");
        cache.get("missing");
        assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
    }
}
