//! Time-bucketed accumulators.
//!
//! A [`BucketTable`] covers a contiguous, gap-free run of buckets
//! `[align(start), end)` at one granularity. Records are folded into it in
//! any number of chunks; the table is then ranked and turned into a
//! [`ChartSeries`].

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chart_common::{ActivityFilter, ActivityRecord, ChartSeries, Dataset, EntityId, GroupingUnit, Metric};

/// Running totals for one entity in one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTotals {
    pub count: u64,
    pub sum_value: f64,
    pub sum_points: f64,
    pub sum_involved: u64,
}

impl EntityTotals {
    fn add(&mut self, record: &ActivityRecord) {
        self.count += 1;
        self.sum_value += record.value;
        self.sum_points += record.points;
        self.sum_involved += u64::from(record.involved);
    }

    /// The accumulator field a metric reads.
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Count => self.count as f64,
            Metric::Value => self.sum_value,
            Metric::Points => self.sum_points,
            Metric::Involved => self.sum_involved as f64,
        }
    }
}

/// One bucket and the per-entity totals that fell into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub start: DateTime<Utc>,
    pub accumulators: BTreeMap<EntityId, EntityTotals>,
}

/// Buckets for a fixed entity list over a fixed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketTable {
    pub grouping: GroupingUnit,
    /// Entities in expansion order. Ranking ties fall back to this order.
    pub entities: Vec<EntityId>,
    pub buckets: Vec<TimeBucket>,
}

impl BucketTable {
    pub fn new(
        grouping: GroupingUnit,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        entities: Vec<EntityId>,
    ) -> Self {
        let buckets = grouping
            .bucket_starts(start, end)
            .into_iter()
            .map(|start| TimeBucket {
                start,
                accumulators: BTreeMap::new(),
            })
            .collect();
        Self {
            grouping,
            entities,
            buckets,
        }
    }

    fn bucket_index(&self, ts: DateTime<Utc>) -> Option<usize> {
        let first = self.buckets.first()?.start;
        let aligned = self.grouping.align(ts);
        if aligned < first {
            return None;
        }
        let offset = (aligned - first).num_seconds() / self.grouping.step().num_seconds();
        let index = usize::try_from(offset).ok()?;
        (index < self.buckets.len()).then_some(index)
    }

    /// Fold a chunk of records. Records outside the table's range, of an
    /// entity not in the table, or rejected by `filter` are skipped.
    ///
    /// Returns the number of records folded.
    pub fn fold(&mut self, records: &[ActivityRecord], filter: ActivityFilter) -> usize {
        let known: HashSet<&EntityId> = self.entities.iter().collect();
        let mut folded = 0;

        for record in records {
            if !filter.matches(record.kind) || !known.contains(&record.entity_id) {
                continue;
            }
            let Some(index) = self.bucket_index(record.timestamp) else {
                continue;
            };
            self.buckets[index]
                .accumulators
                .entry(record.entity_id.clone())
                .or_default()
                .add(record);
            folded += 1;
        }
        folded
    }

    pub fn labels(&self) -> Vec<String> {
        self.buckets
            .iter()
            .map(|bucket| self.grouping.label(bucket.start))
            .collect()
    }

    fn value(&self, bucket: &TimeBucket, entity: &EntityId, metric: Metric) -> f64 {
        bucket
            .accumulators
            .get(entity)
            .map_or(0.0, |totals| totals.metric(metric))
    }

    /// Total of `metric` for `entity` across all buckets.
    pub fn total(&self, entity: &EntityId, metric: Metric) -> f64 {
        self.buckets
            .iter()
            .map(|bucket| self.value(bucket, entity, metric))
            .sum()
    }

    /// Top `limit` entities by `metric` total as gap-filled datasets.
    ///
    /// The sort is stable, so entities with equal totals keep their order in
    /// [`BucketTable::entities`].
    pub fn to_series(&self, metric: Metric, limit: usize) -> ChartSeries {
        let mut ranked: Vec<(&EntityId, f64)> = self
            .entities
            .iter()
            .map(|entity| (entity, self.total(entity, metric)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let datasets = ranked
            .into_iter()
            .take(limit)
            .map(|(entity, _)| {
                let values = self
                    .buckets
                    .iter()
                    .map(|bucket| self.value(bucket, entity, metric))
                    .collect();
                Dataset::new(entity.as_str(), values)
            })
            .collect();

        ChartSeries::new(self.labels(), datasets)
    }
}
