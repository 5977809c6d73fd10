//! Test doubles for the repository and cache store seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use chart_common::{ActivityRecord, CacheError, EntityId, RepositoryError};
use storage::{ActivityRepository, CacheStore, MemoryRepository};

/// Repository wrapper with scripted failures, latency and concurrency tracking.
pub struct FlakyRepository {
    inner: MemoryRepository,
    record_failures: Mutex<VecDeque<RepositoryError>>,
    related_failures: Mutex<VecDeque<RepositoryError>>,
    delay: Mutex<Duration>,
    record_calls: AtomicU64,
    related_calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FlakyRepository {
    pub fn new(inner: MemoryRepository) -> Self {
        Self {
            inner,
            record_failures: Mutex::new(VecDeque::new()),
            related_failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            record_calls: AtomicU64::new(0),
            related_calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_records(records: impl IntoIterator<Item = ActivityRecord>) -> Self {
        Self::new(MemoryRepository::with_records(records))
    }

    pub fn inner(&self) -> &MemoryRepository {
        &self.inner
    }

    /// Fail the next `times` record queries with `error`.
    pub fn fail_records(&self, times: usize, error: RepositoryError) {
        let mut queue = self.record_failures.lock().unwrap();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail the next `times` related-entity lookups with `error`.
    pub fn fail_related(&self, times: usize, error: RepositoryError) {
        let mut queue = self.related_failures.lock().unwrap();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Latency added to every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn record_calls(&self) -> u64 {
        self.record_calls.load(Ordering::SeqCst)
    }

    pub fn related_calls(&self) -> u64 {
        self.related_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActivityRepository for FlakyRepository {
    async fn get_records(
        &self,
        entities: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, RepositoryError> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        let scripted = self.record_failures.lock().unwrap().pop_front();
        match scripted {
            Some(error) => Err(error),
            None => self.inner.get_records(entities, start, end).await,
        }
    }

    async fn get_related_entities(&self, entity: &EntityId) -> Result<Vec<EntityId>, RepositoryError> {
        self.related_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        let scripted = self.related_failures.lock().unwrap().pop_front();
        match scripted {
            Some(error) => Err(error),
            None => self.inner.get_related_entities(entity).await,
        }
    }
}

/// Cache store whose every operation fails as if Redis were down.
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicU64,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unreachable("connection refused".to_string()))
    }
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        self.fail()
    }

    async fn set_with_ttl(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        self.fail()
    }

    async fn scan_keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CacheError> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, day, ids, kill};

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let repo = FlakyRepository::with_records([kill("a", at(1, 1))]);
        repo.fail_records(2, RepositoryError::Timeout("slow".into()));

        for _ in 0..2 {
            assert!(repo.get_records(&ids(&["a"]), day(1), day(2)).await.is_err());
        }
        let records = repo.get_records(&ids(&["a"]), day(1), day(2)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(repo.record_calls(), 3);
    }

    #[tokio::test]
    async fn test_tracks_concurrency() {
        let repo = FlakyRepository::new(MemoryRepository::new());
        repo.set_delay(Duration::from_millis(20));
        let a = EntityId::new("a");
        let lookups = (0..3).map(|_| repo.get_related_entities(&a));
        futures::future::join_all(lookups).await;
        assert_eq!(repo.max_in_flight(), 3);
        assert_eq!(repo.related_calls(), 3);
    }

    #[tokio::test]
    async fn test_failing_store_counts_calls() {
        let store = FailingStore::new();
        assert!(store.get("k").await.is_err());
        assert!(store.scan_keys("*").await.is_err());
        assert_eq!(store.calls(), 2);
    }
}
