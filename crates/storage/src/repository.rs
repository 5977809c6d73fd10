//! Activity record repository.
//!
//! The backing store's schema and write path live outside this workspace;
//! the pipeline only consumes the two queries below.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use chart_common::{ActivityRecord, EntityId, RepositoryError};

/// Source of raw activity records.
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    /// Records of `entities` with `start <= timestamp < end`.
    async fn get_records(
        &self,
        entities: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, RepositoryError>;

    /// Entities related to `entity` (alts, corp members, ...), excluding itself.
    async fn get_related_entities(&self, entity: &EntityId) -> Result<Vec<EntityId>, RepositoryError>;
}

/// On-disk JSON form of a [`MemoryRepository`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub records: Vec<ActivityRecord>,
    #[serde(default)]
    pub related: HashMap<EntityId, Vec<EntityId>>,
}

#[derive(Default)]
struct RepositoryData {
    records: Vec<ActivityRecord>,
    related: HashMap<EntityId, Vec<EntityId>>,
}

/// In-memory repository backed by a record list and a relation map.
#[derive(Default)]
pub struct MemoryRepository {
    data: RwLock<RepositoryData>,
    record_queries: AtomicU64,
    related_queries: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RepositorySnapshot) -> Self {
        Self {
            data: RwLock::new(RepositoryData {
                records: snapshot.records,
                related: snapshot.related,
            }),
            ..Self::default()
        }
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        let bytes = std::fs::read(path).map_err(|e| {
            RepositoryError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        let snapshot: RepositorySnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            RepositoryError::Rejected(format!("invalid record file {}: {}", path.display(), e))
        })?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn with_records(records: impl IntoIterator<Item = ActivityRecord>) -> Self {
        Self::from_snapshot(RepositorySnapshot {
            records: records.into_iter().collect(),
            related: HashMap::new(),
        })
    }

    pub async fn insert(&self, record: ActivityRecord) {
        self.data.write().await.records.push(record);
    }

    /// Record `related` as related to `entity`.
    pub async fn relate(&self, entity: impl Into<EntityId>, related: impl Into<EntityId>) {
        self.data
            .write()
            .await
            .related
            .entry(entity.into())
            .or_default()
            .push(related.into());
    }

    pub fn record_queries(&self) -> u64 {
        self.record_queries.load(Ordering::Relaxed)
    }

    pub fn related_queries(&self) -> u64 {
        self.related_queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ActivityRepository for MemoryRepository {
    async fn get_records(
        &self,
        entities: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, RepositoryError> {
        self.record_queries.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().await;
        Ok(data
            .records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end && entities.contains(&r.entity_id))
            .cloned()
            .collect())
    }

    async fn get_related_entities(&self, entity: &EntityId) -> Result<Vec<EntityId>, RepositoryError> {
        self.related_queries.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().await;
        Ok(data
            .related
            .get(entity)
            .map(|ids| ids.iter().filter(|id| *id != entity).cloned().collect())
            .unwrap_or_default())
    }
}
