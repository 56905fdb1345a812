//! Cross-Layer Result Cache
//!
//! Stores aggregated multi-layer results keyed by a fingerprint of the
//! normalized query type, layer set and cache-relevant parameters.
//!
//! - Confidence decays linearly with age and is capped by the confidence the
//!   entry was inserted with.
//! - An entry whose age reached its TTL is a miss, whatever its confidence.
//! - Capacity is bounded; inserting past it evicts the least-recently
//!   *accessed* entry. Every successful [`CrossLayerCache::get`] refreshes recency.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::config::CacheConfig;
use crate::scoring::{clamp_unit, freshness};
use crate::types::LayerPayload;
use crate::utils::{Clock, SystemClock, elapsed_secs, fingerprint};

/// Deterministic fingerprint of a logical query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fingerprint (query type, layer set, parameters)
    ///
    /// The query type is trimmed and lowercased, layers are trimmed, sorted and
    /// deduplicated, and parameters are ordered by key, so argument order never
    /// changes the key.
    pub fn fingerprint<L, S>(query_type: &str, layers: L, params: &BTreeMap<String, String>) -> Self
    where
        L: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let query_type = query_type.trim().to_lowercase();
        let layers: BTreeSet<String> = layers
            .into_iter()
            .map(|l| l.as_ref().trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let params: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut parts: Vec<&str> = vec!["qt", &query_type, "layers"];
        parts.extend(layers.iter().map(String::as_str));
        parts.push("params");
        parts.extend(params.iter().map(String::as_str));

        Self(fingerprint(parts))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One cached aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossLayerCacheEntry {
    pub cache_key: CacheKey,
    pub timestamp: DateTime<Utc>,
    pub layers_included: Vec<String>,
    pub aggregate_result: BTreeMap<String, LayerPayload>,
    /// Confidence at insertion time
    pub confidence: f64,
    pub ttl_seconds: u64,
}

impl CrossLayerCacheEntry {
    /// Confidence at `now`; non-increasing in `now`
    pub fn confidence_at(&self, now: DateTime<Utc>) -> f64 {
        let age = elapsed_secs(self.timestamp, now);
        self.confidence.min(freshness(age, self.ttl_seconds as f64))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_secs(self.timestamp, now) >= self.ttl_seconds as f64
    }
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CrossLayerCacheEntry,
    pub confidence: f64,
}

/// Counters since construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheInner {
    entries: LruCache<CacheKey, CrossLayerCacheEntry>,
    stats: CacheStats,
}

/// Bounded, TTL-aware LRU cache shared across execution paths
pub struct CrossLayerCache {
    inner: Mutex<CacheInner>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl CrossLayerCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            config,
            clock,
        }
    }

    /// Look up a live entry, refreshing its recency
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.pop(key);
            inner.stats.expired += 1;
            inner.stats.misses += 1;
            debug!(cache_key = %key, "Cache entry expired");
            return None;
        }

        let entry = inner.entries.get(key)?.clone();
        inner.stats.hits += 1;
        let confidence = entry.confidence_at(now);
        Some(CacheHit { entry, confidence })
    }

    /// Current confidence of a live entry without touching recency or counters
    pub fn peek_confidence(&self, key: &CacheKey) -> Option<f64> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.confidence_at(now))
    }

    /// Insert with the configured insert confidence
    ///
    /// `ttl_seconds` of `None` uses the configured default.
    pub fn put(
        &self,
        key: CacheKey,
        layers_included: Vec<String>,
        aggregate_result: BTreeMap<String, LayerPayload>,
        ttl_seconds: Option<u64>,
    ) {
        self.put_with_confidence(
            key,
            layers_included,
            aggregate_result,
            ttl_seconds,
            self.config.insert_confidence,
        );
    }

    pub fn put_with_confidence(
        &self,
        key: CacheKey,
        layers_included: Vec<String>,
        aggregate_result: BTreeMap<String, LayerPayload>,
        ttl_seconds: Option<u64>,
        confidence: f64,
    ) {
        let ttl_seconds = ttl_seconds
            .filter(|ttl| *ttl > 0)
            .unwrap_or(self.config.default_ttl_seconds);
        let entry = CrossLayerCacheEntry {
            cache_key: key.clone(),
            timestamp: self.clock.now(),
            layers_included,
            aggregate_result,
            confidence: clamp_unit(confidence),
            ttl_seconds,
        };

        let mut inner = self.inner.lock();
        inner.stats.insertions += 1;
        if let Some((evicted_key, _)) = inner.entries.push(key.clone(), entry) {
            if evicted_key != key {
                inner.stats.evictions += 1;
                debug!(cache_key = %evicted_key, "Evicted least-recently-used cache entry");
            }
        }
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Remove every entry matching `predicate`; returns how many were removed
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CrossLayerCacheEntry) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            inner.entries.pop(key);
        }
        doomed.len()
    }

    /// Remove every entry that includes `layer`
    pub fn invalidate_layer(&self, layer: &str) -> usize {
        self.invalidate_where(|entry| entry.layers_included.iter().any(|l| l == layer))
    }

    /// Sweep expired entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self.invalidate_where(|entry| entry.is_expired(now));
        if removed > 0 {
            self.inner.lock().stats.expired += removed as u64;
            debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            ..inner.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn default_ttl_seconds(&self) -> u64 {
        self.config.default_ttl_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LayerRecord;
    use crate::utils::ManualClock;

    fn cache(max_entries: usize) -> (CrossLayerCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cache = CrossLayerCache::with_clock(
            CacheConfig {
                max_entries,
                default_ttl_seconds: 300,
                insert_confidence: 0.95,
            },
            clock.clone(),
        );
        (cache, clock)
    }

    fn result(layer: &str) -> BTreeMap<String, LayerPayload> {
        let mut map = BTreeMap::new();
        map.insert(
            layer.to_string(),
            vec![LayerRecord::new("1", serde_json::json!({"text": "hello"}))],
        );
        map
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::fingerprint(name, ["episodic"], &BTreeMap::new())
    }

    #[test]
    fn test_fingerprint_ignores_ordering() {
        let mut params_a = BTreeMap::new();
        params_a.insert("limit".to_string(), "10".to_string());
        params_a.insert("since".to_string(), "2024".to_string());
        let mut params_b = BTreeMap::new();
        params_b.insert("since".to_string(), "2024".to_string());
        params_b.insert("limit".to_string(), "10".to_string());

        let a = CacheKey::fingerprint("Temporal", ["semantic", "episodic"], &params_a);
        let b = CacheKey::fingerprint(" temporal ", ["episodic", "semantic", "episodic"], &params_b);
        assert_eq!(a, b);

        let c = CacheKey::fingerprint("temporal", ["episodic"], &params_a);
        assert_ne!(a, c);
    }

    #[test]
    fn test_confidence_decay_and_expiry() {
        let (cache, clock) = cache(10);
        let k = key("temporal");
        cache.put(k.clone(), vec!["episodic".into()], result("episodic"), Some(300));

        let hit = cache.get(&k).unwrap();
        assert!((hit.confidence - 0.95).abs() < 1e-9);

        clock.advance_secs(150);
        let hit = cache.get(&k).unwrap();
        assert!((hit.confidence - 0.5).abs() < 1e-6);

        clock.advance_secs(151);
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_confidence_is_non_increasing() {
        let (cache, clock) = cache(10);
        let k = key("temporal");
        cache.put(k.clone(), vec!["episodic".into()], result("episodic"), Some(60));

        let mut previous = f64::MAX;
        for _ in 0..59 {
            let confidence = cache.peek_confidence(&k).unwrap();
            assert!(confidence <= previous);
            previous = confidence;
            clock.advance_secs(1);
        }
        clock.advance_secs(1);
        assert!(cache.peek_confidence(&k).is_none());
    }

    #[test]
    fn test_capacity_evicts_least_recently_accessed() {
        let (cache, _clock) = cache(3);
        let (a, b, c, d) = (key("a"), key("b"), key("c"), key("d"));
        cache.put(a.clone(), vec![], result("episodic"), None);
        cache.put(b.clone(), vec![], result("episodic"), None);
        cache.put(c.clone(), vec![], result("episodic"), None);

        // Touch "a" so "b" becomes least recently accessed
        assert!(cache.get(&a).is_some());
        cache.put(d.clone(), vec![], result("episodic"), None);

        assert_eq!(cache.len(), 3);
        assert!(cache.peek_confidence(&b).is_none());
        assert!(cache.peek_confidence(&a).is_some());
        assert!(cache.peek_confidence(&c).is_some());
        assert!(cache.peek_confidence(&d).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let (cache, _clock) = cache(5);
        for i in 0..50 {
            cache.put(key(&format!("q{}", i)), vec![], result("episodic"), None);
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.stats().evictions, 45);
    }

    #[test]
    fn test_peek_does_not_refresh_recency() {
        let (cache, _clock) = cache(2);
        let (a, b, c) = (key("a"), key("b"), key("c"));
        cache.put(a.clone(), vec![], result("episodic"), None);
        cache.put(b.clone(), vec![], result("episodic"), None);

        assert!(cache.peek_confidence(&a).is_some());
        cache.put(c, vec![], result("episodic"), None);

        assert!(cache.peek_confidence(&a).is_none());
        assert!(cache.peek_confidence(&b).is_some());
    }

    #[test]
    fn test_invalidation() {
        let (cache, clock) = cache(10);
        cache.put(key("a"), vec!["episodic".into()], result("episodic"), None);
        cache.put(key("b"), vec!["semantic".into()], result("semantic"), None);
        cache.put(key("c"), vec!["episodic".into(), "graph".into()], result("graph"), Some(10));

        assert!(cache.invalidate_key(&key("b")));
        assert!(!cache.invalidate_key(&key("b")));

        clock.advance_secs(20);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.invalidate_layer("episodic"), 1);
        assert!(cache.is_empty());
    }
}
