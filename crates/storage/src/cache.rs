//! Typed, best-effort cache layer over a [`CacheStore`].
//!
//! Every operation swallows store failures: they are logged, counted and
//! reported as a miss (reads) or a no-op (writes). The cache is an
//! accelerator and never a reason for a request to fail.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use chart_common::{CacheError, EntityId};

use crate::keys::{namespace_slot, CacheKey, KeyDeriver, KeyParams, Namespace};
use crate::store::CacheStore;

/// Per-namespace time to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub raw_query: Duration,
    pub aggregated_data: Duration,
    pub series: Duration,
    pub rendered_image: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            raw_query: Duration::from_secs(120),
            aggregated_data: Duration::from_secs(300),
            series: Duration::from_secs(300),
            rendered_image: Duration::from_secs(1800),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::RawQuery => self.raw_query,
            Namespace::AggregatedData => self.aggregated_data,
            Namespace::Series => self.series,
            Namespace::RenderedImage => self.rendered_image,
        }
    }
}

#[derive(Debug, Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl NamespaceCounters {
    fn snapshot(&self) -> NamespaceStats {
        NamespaceStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

impl NamespaceStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Snapshot of cache layer counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub raw_query: NamespaceStats,
    pub aggregated_data: NamespaceStats,
    pub series: NamespaceStats,
    pub rendered_image: NamespaceStats,
    /// Entries removed by invalidation.
    pub invalidated: u64,
    /// Store failures during invalidation scans and deletes.
    pub invalidation_errors: u64,
}

impl CacheStats {
    pub fn namespace(&self, namespace: Namespace) -> &NamespaceStats {
        match namespace {
            Namespace::RawQuery => &self.raw_query,
            Namespace::AggregatedData => &self.aggregated_data,
            Namespace::Series => &self.series,
            Namespace::RenderedImage => &self.rendered_image,
        }
    }
}

/// Read-through/write-through cache for every pipeline stage.
pub struct ChartCache {
    store: Arc<dyn CacheStore>,
    keys: KeyDeriver,
    ttl: TtlPolicy,
    counters: [NamespaceCounters; 4],
    invalidated: AtomicU64,
    invalidation_errors: AtomicU64,
}

impl ChartCache {
    pub fn new(store: Arc<dyn CacheStore>, keys: KeyDeriver, ttl: TtlPolicy) -> Self {
        Self {
            store,
            keys,
            ttl,
            counters: Default::default(),
            invalidated: AtomicU64::new(0),
            invalidation_errors: AtomicU64::new(0),
        }
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn derive(&self, namespace: Namespace, params: &KeyParams) -> CacheKey {
        self.keys.derive(namespace, params)
    }

    fn counters(&self, namespace: Namespace) -> &NamespaceCounters {
        &self.counters[namespace_slot(namespace)]
    }

    fn record_error(&self, namespace: Namespace, op: &str, key: &str, error: &CacheError) {
        self.counters(namespace).errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            namespace = %namespace,
            key = %key,
            operation = op,
            error = %error,
            "Cache store operation failed"
        );
    }

    /// Raw bytes for `key`, `None` on miss or store failure.
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Bytes> {
        let ns = key.namespace();
        match self.store.get(key.as_str()).await {
            Ok(Some(value)) => {
                self.counters(ns).hits.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = %ns, key = %key, bytes = value.len(), "Cache hit");
                Some(value)
            }
            Ok(None) => {
                self.counters(ns).misses.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = %ns, key = %key, "Cache miss");
                None
            }
            Err(e) => {
                self.record_error(ns, "get", key.as_str(), &e);
                self.counters(ns).misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store raw bytes plus the index entries used by invalidation.
    pub async fn set_bytes(&self, key: &CacheKey, value: &[u8]) {
        let ns = key.namespace();
        let ttl = self.ttl.ttl_for(ns);

        // Index entries go first: a dangling index entry is harmless, an
        // unindexed entry would survive invalidation until its TTL.
        let mut index_keys: Vec<String> = key
            .referenced_entities()
            .into_iter()
            .map(|entity| self.keys.entity_index_key(entity, key))
            .collect();
        index_keys.extend(self.keys.span_index_key(key));

        for index_key in &index_keys {
            if let Err(e) = self
                .store
                .set_with_ttl(index_key, key.as_str().as_bytes(), ttl)
                .await
            {
                self.record_error(ns, "set_index", index_key, &e);
                return;
            }
        }

        match self.store.set_with_ttl(key.as_str(), value, ttl).await {
            Ok(()) => {
                self.counters(ns).writes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    namespace = %ns,
                    key = %key,
                    bytes = value.len(),
                    ttl_secs = ttl.as_secs(),
                    "Cache write"
                );
            }
            Err(e) => self.record_error(ns, "set", key.as_str(), &e),
        }
    }

    /// Decoded JSON value for `key`. Entries that fail to decode are dropped.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                let ns = key.namespace();
                let error = CacheError::Malformed {
                    key: key.as_str().to_string(),
                    message: e.to_string(),
                };
                self.record_error(ns, "decode", key.as_str(), &error);
                // The lookup was counted as a hit; it is really a miss.
                self.counters(ns).hits.fetch_sub(1, Ordering::Relaxed);
                self.counters(ns).misses.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.store.delete(key.as_str()).await {
                    self.record_error(ns, "delete", key.as_str(), &e);
                }
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &CacheKey, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set_bytes(key, &bytes).await,
            Err(e) => {
                let error = CacheError::Malformed {
                    key: key.as_str().to_string(),
                    message: e.to_string(),
                };
                self.record_error(key.namespace(), "encode", key.as_str(), &error);
            }
        }
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        match self.store.scan_keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                self.invalidation_errors.fetch_add(1, Ordering::Relaxed);
                warn!(pattern = %pattern, error = %e, "Cache scan failed");
                Vec::new()
            }
        }
    }

    /// Delete `key`, returning whether a live entry was removed.
    async fn remove(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.invalidation_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    /// Remove targets and the index entries that pointed at them.
    async fn remove_indexed(&self, entries: Vec<(String, String)>) -> u64 {
        let mut targets = BTreeSet::new();
        for (index_key, target) in entries {
            self.remove(&index_key).await;
            targets.insert(target);
        }

        let mut removed = 0u64;
        for target in targets {
            if self.remove(&target).await {
                removed += 1;
            }
        }
        self.invalidated.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    /// Remove every entry derived from a parameter set containing one of `entities`.
    pub async fn invalidate_by_entities(&self, entities: &[EntityId]) -> u64 {
        let mut entries = Vec::new();
        for entity in entities {
            for index_key in self.scan(&self.keys.entity_index_pattern(entity)).await {
                if let Some(target) = self.keys.parse_entity_index(&index_key) {
                    entries.push((index_key, target));
                }
            }
        }

        let removed = self.remove_indexed(entries).await;
        info!(
            entities = entities.len(),
            removed = removed,
            "Invalidated cache entries by entity"
        );
        removed
    }

    /// Remove every entry whose time span overlaps `[start, end)`.
    pub async fn invalidate_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let entries: Vec<(String, String)> = self
            .scan(&self.keys.span_index_pattern())
            .await
            .into_iter()
            .filter_map(|index_key| {
                let span = self.keys.parse_span_index(&index_key)?;
                let overlaps = span.start_millis < end_ms && start_ms < span.end_millis;
                overlaps.then_some((index_key, span.target))
            })
            .collect();

        let removed = self.remove_indexed(entries).await;
        info!(
            start = %start,
            end = %end,
            removed = removed,
            "Invalidated cache entries by time range"
        );
        removed
    }

    /// Remove everything under the key prefix. Returns the number of entries
    /// removed, not counting index entries.
    pub async fn invalidate_all(&self) -> u64 {
        let mut removed = 0u64;
        for key in self.scan(&self.keys.all_pattern()).await {
            if self.remove(&key).await && !self.keys.is_index_key(&key) {
                removed += 1;
            }
        }
        self.invalidated.fetch_add(removed, Ordering::Relaxed);
        info!(removed = removed, prefix = %self.keys.prefix(), "Invalidated all cache entries");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            raw_query: self.counters(Namespace::RawQuery).snapshot(),
            aggregated_data: self.counters(Namespace::AggregatedData).snapshot(),
            series: self.counters(Namespace::Series).snapshot(),
            rendered_image: self.counters(Namespace::RenderedImage).snapshot(),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            invalidation_errors: self.invalidation_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde::Deserialize;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn cache() -> ChartCache {
        ChartCache::new(
            Arc::new(MemoryStore::new(16, 10_000)),
            KeyDeriver::default(),
            TtlPolicy::default(),
        )
    }

    fn key(cache: &ChartCache, ns: Namespace, ids: &[&str], start: u32, end: u32) -> CacheKey {
        cache.derive(
            ns,
            &KeyParams::new()
                .entities(ids.iter().copied())
                .span(day(start), day(end)),
        )
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        values: Vec<u32>,
    }

    #[tokio::test]
    async fn test_json_round_trip_and_stats() {
        let cache = cache();
        let k = key(&cache, Namespace::Series, &["a"], 1, 8);

        assert!(cache.get_json::<Payload>(&k).await.is_none());
        cache.set_json(&k, &Payload { values: vec![1, 2] }).await;
        assert_eq!(
            cache.get_json::<Payload>(&k).await,
            Some(Payload { values: vec![1, 2] })
        );

        let stats = cache.stats();
        assert_eq!(stats.series.hits, 1);
        assert_eq!(stats.series.misses, 1);
        assert_eq!(stats.series.writes, 1);
        assert_eq!(stats.series.hit_rate(), 0.5);
        assert_eq!(stats.rendered_image, NamespaceStats::default());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_dropped() {
        let store = Arc::new(MemoryStore::new(16, 10_000));
        let cache = ChartCache::new(store.clone(), KeyDeriver::default(), TtlPolicy::default());
        let k = key(&cache, Namespace::Series, &["a"], 1, 8);

        store
            .set_with_ttl(k.as_str(), b"not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get_json::<Payload>(&k).await.is_none());
        assert!(store.get(k.as_str()).await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.series.errors, 1);
        assert_eq!(stats.series.hits, 0);
        assert_eq!(stats.series.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_entities_is_selective() {
        let cache = cache();
        let ab = key(&cache, Namespace::Series, &["a", "b"], 1, 8);
        let c = key(&cache, Namespace::Series, &["c"], 1, 8);
        let img = key(&cache, Namespace::RenderedImage, &["b"], 1, 8);
        let tagged = key(&cache, Namespace::RenderedImage, &["d"], 1, 8).with_tags(["a"]);

        for k in [&ab, &c, &img, &tagged] {
            cache.set_bytes(k, b"x").await;
        }

        let removed = cache.invalidate_by_entities(&[EntityId::new("a")]).await;
        assert_eq!(removed, 2);
        assert!(cache.get_bytes(&ab).await.is_none());
        assert!(cache.get_bytes(&tagged).await.is_none());
        assert!(cache.get_bytes(&c).await.is_some());
        assert!(cache.get_bytes(&img).await.is_some());

        assert_eq!(cache.invalidate_by_entities(&[EntityId::new("b")]).await, 1);
        assert!(cache.get_bytes(&c).await.is_some());
        assert_eq!(cache.stats().invalidated, 3);
    }

    #[tokio::test]
    async fn test_invalidate_by_time_range_uses_overlap() {
        let cache = cache();
        let early = key(&cache, Namespace::Series, &["a"], 1, 3);
        let middle = key(&cache, Namespace::Series, &["a"], 5, 7);
        let late = key(&cache, Namespace::Series, &["a"], 10, 12);
        for k in [&early, &middle, &late] {
            cache.set_bytes(k, b"x").await;
        }

        // [3, 6) touches only the middle entry; early ends exactly at 3.
        assert_eq!(cache.invalidate_by_time_range(day(3), day(6)).await, 1);
        assert!(cache.get_bytes(&early).await.is_some());
        assert!(cache.get_bytes(&middle).await.is_none());
        assert!(cache.get_bytes(&late).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = cache();
        cache.set_bytes(&key(&cache, Namespace::Series, &["a"], 1, 3), b"x").await;
        cache.set_bytes(&key(&cache, Namespace::RawQuery, &["b"], 1, 3), b"y").await;
        assert_eq!(cache.invalidate_all().await, 2);
        assert!(cache
            .get_bytes(&key(&cache, Namespace::Series, &["a"], 1, 3))
            .await
            .is_none());
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
            Err(CacheError::Unreachable("down".into()))
        }
        async fn set_with_ttl(&self, _: &str, _: &[u8], _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unreachable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unreachable("down".into()))
        }
        async fn scan_keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unreachable("down".into()))
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CacheError> {
            Err(CacheError::Unreachable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_misses() {
        let cache = ChartCache::new(Arc::new(BrokenStore), KeyDeriver::default(), TtlPolicy::default());
        let k = cache.derive(Namespace::RenderedImage, &KeyParams::new().entities(["a"]));

        cache.set_bytes(&k, b"png").await;
        assert!(cache.get_bytes(&k).await.is_none());
        assert_eq!(cache.invalidate_by_entities(&[EntityId::new("a")]).await, 0);
        assert_eq!(cache.invalidate_all().await, 0);

        let stats = cache.stats();
        assert_eq!(stats.rendered_image.errors, 2);
        assert_eq!(stats.rendered_image.misses, 1);
        assert_eq!(stats.rendered_image.writes, 0);
        assert_eq!(stats.invalidation_errors, 2);
    }

    #[tokio::test]
    async fn test_entries_use_namespace_ttl() {
        let store = Arc::new(MemoryStore::new(16, 10_000));
        let cache = ChartCache::new(store.clone(), KeyDeriver::default(), TtlPolicy::default());
        let k = key(&cache, Namespace::RenderedImage, &["a"], 1, 2);
        cache.set_bytes(&k, b"png").await;

        let ttl = store.ttl(k.as_str()).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(1700) && ttl <= Duration::from_secs(1800));
    }
}
