//! Response cache keyed by request fingerprint.
//!
//! The fingerprint is a SHA-256 over a canonical byte form of the
//! normalized prompt, `max_tokens` and `temperature`, so identical inputs
//! hash identically across processes. User identity is deliberately not
//! part of the key; responses are shareable. Streaming requests bypass the
//! cache entirely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CachingConfig;
use crate::types::{AdapterRequest, GatewayResponse};

/// Deterministic fingerprint over (prompt, max_tokens, temperature).
pub fn fingerprint(prompt: &str, max_tokens: Option<u32>, temperature: Option<f32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    match max_tokens {
        Some(value) => hasher.update(value.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher.update([0u8]);
    match temperature {
        Some(value) => hasher.update(format!("{value:.4}").as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

struct CacheEntry {
    response: GatewayResponse,
    inserted_at: Instant,
    hit_count: u64,
    ttl: Duration,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Process-local response cache with TTL expiry and bottom-decile eviction
/// at capacity.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    default_ttl: Duration,
    task_ttl: HashMap<String, Duration>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &CachingConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: config.max_entries.max(1),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            task_ttl: config
                .task_ttl_overrides
                .iter()
                .map(|(task, secs)| (task.clone(), Duration::from_secs(*secs)))
                .collect(),
            enabled: config.enabled,
        }
    }

    fn ttl_for(&self, task_type: Option<&str>) -> Duration {
        task_type
            .and_then(|task| self.task_ttl.get(task))
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Returns a fresh cached response, marked `cached=true` and carrying
    /// the original latency. Streaming requests never hit.
    pub fn get(&self, request: &AdapterRequest) -> Option<GatewayResponse> {
        if !self.enabled || request.stream {
            return None;
        }

        let key = fingerprint(&request.prompt, request.max_tokens, request.temperature);
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let expired = match inner.entries.get(&key) {
            Some(entry) => entry.inserted_at.elapsed() >= entry.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.remove(&key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(&key).expect("entry checked above");
        entry.hit_count += 1;
        let mut response = entry.response.clone();
        response.cached = true;
        debug!(fingerprint = %key, "cache hit");
        Some(response)
    }

    /// Stores a response. At capacity the bottom 10% of entries ordered by
    /// (hit count ascending, insertion time ascending) are evicted first.
    pub fn put(&self, request: &AdapterRequest, response: &GatewayResponse) {
        if !self.enabled || request.stream {
            return;
        }

        let key = fingerprint(&request.prompt, request.max_tokens, request.temperature);
        let ttl = self.ttl_for(request.task_type.as_deref());
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            evict_bottom_decile(&mut inner.entries);
        }

        inner.entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                inserted_at: Instant::now(),
                hit_count: 0,
                ttl,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").entries.clear();
    }
}

fn evict_bottom_decile(entries: &mut HashMap<String, CacheEntry>) {
    let evict_count = (entries.len() / 10).max(1);
    let mut ranked: Vec<(String, u64, Instant)> = entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.hit_count, entry.inserted_at))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
    for (key, _, _) in ranked.into_iter().take(evict_count) {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GatewayRequest;

    fn enriched(prompt: &str) -> AdapterRequest {
        let mut request = GatewayRequest::new(prompt, "u1");
        request.max_tokens = Some(50);
        request.temperature = Some(0.7);
        crate::types::enrich(&request).unwrap()
    }

    fn response_for(request: &AdapterRequest, content: &str) -> GatewayResponse {
        GatewayResponse {
            content: content.into(),
            model_used: "gpt-4o".into(),
            provider: "openai".into(),
            request_id: request.request_id.clone(),
            tokens_used: 10,
            cost_estimate: 0.001,
            latency_ms: 321,
            cached: false,
            user_id: request.user_id.clone(),
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    fn small_cache(max_entries: usize) -> ResponseCache {
        let mut config = CachingConfig::default();
        config.max_entries = max_entries;
        ResponseCache::new(&config)
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("Hello", Some(50), Some(0.7));
        let b = fingerprint("Hello", Some(50), Some(0.7));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_varies_with_inputs() {
        let base = fingerprint("Hello", Some(50), Some(0.7));
        assert_ne!(base, fingerprint("Hello!", Some(50), Some(0.7)));
        assert_ne!(base, fingerprint("Hello", Some(51), Some(0.7)));
        assert_ne!(base, fingerprint("Hello", Some(50), Some(0.8)));
        assert_ne!(base, fingerprint("Hello", None, Some(0.7)));
    }

    #[test]
    fn hit_preserves_latency_and_sets_cached() {
        let cache = small_cache(10);
        let request = enriched("hello world");
        cache.put(&request, &response_for(&request, "hi"));

        let hit = cache.get(&request).unwrap();
        assert!(hit.cached);
        assert_eq!(hit.latency_ms, 321);
        assert_eq!(hit.content, "hi");
    }

    #[test]
    fn identical_inputs_share_entries_across_users() {
        let cache = small_cache(10);
        let request = enriched("hello world");
        cache.put(&request, &response_for(&request, "hi"));

        let mut other = GatewayRequest::new("hello world", "someone-else");
        other.max_tokens = Some(50);
        other.temperature = Some(0.7);
        let other = crate::types::enrich(&other).unwrap();
        assert!(cache.get(&other).is_some());
    }

    #[test]
    fn streaming_requests_bypass_cache() {
        let cache = small_cache(10);
        let mut request = enriched("hello world");
        let response = response_for(&request, "hi");
        request.stream = true;
        cache.put(&request, &response);
        assert!(cache.get(&request).is_none());

        request.stream = false;
        assert!(cache.get(&request).is_none(), "stream=true put was dropped");
    }

    #[test]
    fn expired_entries_miss() {
        let mut config = CachingConfig::default();
        config.default_ttl_secs = 0;
        let cache = ResponseCache::new(&config);
        let request = enriched("hello world");
        cache.put(&request, &response_for(&request, "hi"));
        assert!(cache.get(&request).is_none());
    }

    #[test]
    fn eviction_removes_cold_entries_first() {
        let cache = small_cache(10);
        let requests: Vec<AdapterRequest> =
            (0..10).map(|i| enriched(&format!("prompt {i}"))).collect();
        for request in &requests {
            cache.put(request, &response_for(request, "r"));
        }
        // Warm everything except prompt 0.
        for request in requests.iter().skip(1) {
            cache.get(request);
        }

        let overflow = enriched("prompt overflow");
        cache.put(&overflow, &response_for(&overflow, "r"));

        assert!(cache.get(&requests[0]).is_none(), "cold entry evicted");
        assert!(cache.get(&requests[9]).is_some(), "warm entry kept");
        assert!(cache.get(&overflow).is_some());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = small_cache(10);
        let request = enriched("hello world");
        assert!(cache.get(&request).is_none());
        cache.put(&request, &response_for(&request, "hi"));
        assert!(cache.get(&request).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let mut config = CachingConfig::default();
        config.enabled = false;
        let cache = ResponseCache::new(&config);
        let request = enriched("hello world");
        cache.put(&request, &response_for(&request, "hi"));
        assert!(cache.get(&request).is_none());
    }
}
