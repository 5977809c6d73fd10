//! The aggregation engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use chart_common::{ActivityRecord, AggregationError, ChartSeries, EntityId};
use storage::{ActivityRepository, ChartCache, KeyParams, Namespace};

use crate::buckets::BucketTable;
use crate::config::AggregationConfig;
use crate::query::AggregationQuery;
use crate::retry::with_retry;

/// Series plus the expanded entity set it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    pub series: ChartSeries,
    /// Requested entities followed by their related entities.
    pub entities: Vec<EntityId>,
}

/// Expands, fetches, reduces and ranks activity records.
pub struct AggregationEngine {
    repository: Arc<dyn ActivityRepository>,
    cache: Arc<ChartCache>,
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(
        repository: Arc<dyn ActivityRepository>,
        cache: Arc<ChartCache>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Aggregate `query` into a chart series.
    pub async fn aggregate(&self, query: &AggregationQuery) -> Result<ChartSeries, AggregationError> {
        Ok(self.aggregate_detailed(query).await?.series)
    }

    /// Aggregate `query`, also returning the expanded entity set.
    #[instrument(
        skip(self, query),
        fields(
            entities = query.entity_ids.len(),
            grouping = %query.grouping,
            metric = %query.metric,
            limit = query.limit
        )
    )]
    pub async fn aggregate_detailed(
        &self,
        query: &AggregationQuery,
    ) -> Result<AggregationOutcome, AggregationError> {
        query.validate_within(self.config.max_buckets)?;
        let started = Instant::now();

        let entities = self.expand_entities(&query.unique_entities()).await?;
        let table = self.bucket_table(query, &entities).await?;
        let series = table.to_series(query.metric, query.limit);

        info!(
            expanded_entities = entities.len(),
            labels = series.labels.len(),
            datasets = series.datasets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation complete"
        );

        Ok(AggregationOutcome { series, entities })
    }

    /// Requested ids followed by every related id, de-duplicated.
    ///
    /// Lookups run in batches of `expansion_batch_size`, with at most
    /// `max_concurrent_batches` batches in flight. Results keep input order.
    pub async fn expand_entities(&self, requested: &[EntityId]) -> Result<Vec<EntityId>, AggregationError> {
        let batch_size = self.config.expansion_batch_size.max(1);
        let concurrency = self.config.max_concurrent_batches.max(1);

        let batches: Vec<_> = requested
            .chunks(batch_size)
            .map(|batch| try_join_all(batch.iter().map(|entity| self.related_entities(entity))))
            .collect();
        let related: Vec<Vec<Vec<EntityId>>> = stream::iter(batches)
            .buffered(concurrency)
            .try_collect()
            .await?;

        let mut seen: HashSet<&EntityId> = HashSet::new();
        let mut expanded = Vec::new();
        for entity in requested.iter().chain(related.iter().flatten().flatten()) {
            if seen.insert(entity) {
                expanded.push(entity.clone());
            }
        }

        debug!(
            requested = requested.len(),
            expanded = expanded.len(),
            batches = requested.len().div_ceil(batch_size),
            "Expanded entity set"
        );
        Ok(expanded)
    }

    async fn related_entities(&self, entity: &EntityId) -> Result<Vec<EntityId>, AggregationError> {
        let key = self.cache.derive(
            Namespace::RawQuery,
            &KeyParams::new()
                .entities([entity.clone()])
                .field("query", "related"),
        );
        if let Some(related) = self.cache.get_json::<Vec<EntityId>>(&key).await {
            return Ok(related);
        }

        let related = with_retry(&self.config.retry, "get_related_entities", || {
            self.repository.get_related_entities(entity)
        })
        .await?;
        self.cache.set_json(&key, &related).await;
        Ok(related)
    }

    /// Reduced buckets for the expanded set, from cache when possible.
    async fn bucket_table(
        &self,
        query: &AggregationQuery,
        entities: &[EntityId],
    ) -> Result<BucketTable, AggregationError> {
        let key = self.cache.derive(
            Namespace::AggregatedData,
            &KeyParams::new()
                .entities(entities.iter().cloned())
                .span(query.start, query.end)
                .field("grouping", query.grouping.as_str())
                .field("filter", query.filter.as_str()),
        );
        if let Some(mut table) = self.cache.get_json::<BucketTable>(&key).await {
            // The key covers the entity set but not its order, which ranking
            // ties depend on.
            table.entities = entities.to_vec();
            return Ok(table);
        }

        let mut table = BucketTable::new(query.grouping, query.start, query.end, entities.to_vec());
        if !entities.is_empty() {
            let records = self.fetch_records(query, entities).await?;
            self.reduce(&mut table, &records, query).await;
        }
        self.cache.set_json(&key, &table).await;
        Ok(table)
    }

    async fn fetch_records(
        &self,
        query: &AggregationQuery,
        entities: &[EntityId],
    ) -> Result<Vec<ActivityRecord>, AggregationError> {
        let key = self.cache.derive(
            Namespace::RawQuery,
            &KeyParams::new()
                .entities(entities.iter().cloned())
                .span(query.start, query.end)
                .field("query", "records"),
        );
        if let Some(records) = self.cache.get_json::<Vec<ActivityRecord>>(&key).await {
            return Ok(records);
        }

        let records = with_retry(&self.config.retry, "get_records", || {
            self.repository.get_records(entities, query.start, query.end)
        })
        .await?;
        debug!(records = records.len(), "Fetched activity records");
        self.cache.set_json(&key, &records).await;
        Ok(records)
    }

    /// Fold records into `table`, yielding to the runtime between chunks.
    async fn reduce(&self, table: &mut BucketTable, records: &[ActivityRecord], query: &AggregationQuery) {
        let chunk_size = self.config.reduce_chunk_size.max(1);
        if records.len() <= chunk_size {
            table.fold(records, query.filter);
            return;
        }

        let mut folded = 0;
        let mut chunks = 0;
        for chunk in records.chunks(chunk_size) {
            folded += table.fold(chunk, query.filter);
            chunks += 1;
            tokio::task::yield_now().await;
        }
        debug!(records = records.len(), folded = folded, chunks = chunks, "Chunked reduction");
    }
}
