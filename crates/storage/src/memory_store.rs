//! In-process LRU cache store.
//!
//! Used when no Redis is configured and throughout the test suites. Entries
//! carry their own TTL which is enforced lazily on read and scan. When the
//! store exceeds its memory limit it evicts ~5% of its capacity (by memory)
//! in one batch, least recently used first.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::info;

use chart_common::CacheError;

use crate::store::{glob_match, CacheStore};

struct StoredValue {
    data: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }

    fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.inserted_at.elapsed())
    }
}

/// Counters for the memory store. All fields are atomic so they can be read
/// without taking the cache lock.
#[derive(Debug, Default)]
pub struct MemoryStoreStats {
    pub size_bytes: AtomicU64,
    pub entry_count: AtomicU64,
    pub expired: AtomicU64,
    pub evictions: AtomicU64,
    pub eviction_runs: AtomicU64,
}

/// LRU store with per-entry TTL and memory-based eviction.
pub struct MemoryStore {
    cache: RwLock<LruCache<String, StoredValue>>,
    max_bytes: u64,
    stats: MemoryStoreStats,
}

impl MemoryStore {
    /// Create a store bounded by `max_size_mb` megabytes and `max_entries` keys.
    pub fn new(max_size_mb: usize, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            max_bytes: (max_size_mb as u64) * 1024 * 1024,
            stats: MemoryStoreStats::default(),
        }
    }

    pub fn stats(&self) -> &MemoryStoreStats {
        &self.stats
    }

    pub fn size_bytes(&self) -> u64 {
        self.stats.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.stats.entry_count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, value: &StoredValue) {
        self.stats
            .size_bytes
            .fetch_sub(value.data.len() as u64, Ordering::Relaxed);
        self.stats.entry_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Evict ~5% of capacity (by memory) in LRU order. Caller holds the lock.
    fn evict_batch_locked(&self, cache: &mut LruCache<String, StoredValue>) {
        let target_free = (self.max_bytes / 20).max(1);
        let mut bytes_freed = 0u64;
        let mut entries_evicted = 0u64;

        while bytes_freed < target_free {
            match cache.pop_lru() {
                Some((_, evicted)) => {
                    bytes_freed += evicted.data.len() as u64;
                    entries_evicted += 1;
                    self.forget(&evicted);
                }
                None => break,
            }
        }

        self.stats
            .evictions
            .fetch_add(entries_evicted, Ordering::Relaxed);
        self.stats.eviction_runs.fetch_add(1, Ordering::Relaxed);

        info!(
            entries_evicted = entries_evicted,
            bytes_freed = bytes_freed,
            max_bytes = self.max_bytes,
            "Memory store batch eviction completed"
        );
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        // LruCache::get updates recency, so even reads need the write lock.
        let mut cache = self.cache.write().await;

        let expired = match cache.get(key) {
            Some(value) if !value.is_expired() => return Ok(Some(value.data.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(value) = cache.pop(key) {
                self.forget(&value);
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let size = value.len() as u64;
        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.pop(key) {
            self.forget(&existing);
        }

        if self.size_bytes() + size > self.max_bytes {
            self.evict_batch_locked(&mut cache);
        }

        let stored = StoredValue {
            data: Bytes::copy_from_slice(value),
            inserted_at: Instant::now(),
            ttl,
        };

        // `push` hands back the entry displaced by the entry-count bound.
        if let Some((_, displaced)) = cache.push(key.to_string(), stored) {
            self.forget(&displaced);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.stats.entry_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut cache = self.cache.write().await;
        match cache.pop(key) {
            Some(value) => {
                self.forget(&value);
                Ok(!value.is_expired())
            }
            None => Ok(false),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let cache = self.cache.read().await;
        let mut keys: Vec<String> = cache
            .iter()
            .filter(|(key, value)| !value.is_expired() && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let cache = self.cache.read().await;
        Ok(cache
            .peek(key)
            .filter(|value| !value.is_expired())
            .map(StoredValue::remaining))
    }
}
