//! Typed aggregation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chart_common::{ActivityFilter, AggregationError, EntityId, GroupingUnit, Metric};

/// Parameters of one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationQuery {
    pub entity_ids: Vec<EntityId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub grouping: GroupingUnit,
    pub metric: Metric,
    pub filter: ActivityFilter,
    /// Maximum number of datasets in the result.
    pub limit: usize,
}

impl AggregationQuery {
    /// Query with the `All` filter and a limit of 10.
    pub fn new(
        entity_ids: impl IntoIterator<Item = impl Into<EntityId>>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        grouping: GroupingUnit,
        metric: Metric,
    ) -> Self {
        Self {
            entity_ids: entity_ids.into_iter().map(Into::into).collect(),
            start,
            end,
            grouping,
            metric,
            filter: ActivityFilter::All,
            limit: 10,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: ActivityFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Reject queries that would fail no matter how often they are retried.
    pub fn validate(&self) -> Result<(), AggregationError> {
        if self.end <= self.start {
            return Err(AggregationError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        if self.limit == 0 {
            return Err(AggregationError::InvalidParameter {
                param: "limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let Some(pos) = self.entity_ids.iter().position(EntityId::is_blank) {
            return Err(AggregationError::MalformedEntitySet(format!(
                "entity id at position {} is empty",
                pos
            )));
        }
        Ok(())
    }

    /// Number of time buckets the result will span.
    pub fn bucket_count(&self) -> u64 {
        self.grouping.bucket_count(self.start, self.end)
    }

    /// `validate`, plus a cap on the number of buckets.
    pub fn validate_within(&self, max_buckets: usize) -> Result<(), AggregationError> {
        self.validate()?;
        let buckets = self.bucket_count();
        if buckets > max_buckets as u64 {
            return Err(AggregationError::InvalidParameter {
                param: "range".to_string(),
                message: format!(
                    "{} {} buckets exceeds the limit of {}",
                    buckets, self.grouping, max_buckets
                ),
            });
        }
        Ok(())
    }

    /// Requested ids in input order with duplicates removed.
    pub fn unique_entities(&self) -> Vec<EntityId> {
        let mut seen = std::collections::HashSet::new();
        self.entity_ids
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn query() -> AggregationQuery {
        AggregationQuery::new(["a", "b"], day(1), day(8), GroupingUnit::Day, Metric::Count)
    }

    #[test]
    fn test_validate() {
        assert!(query().validate().is_ok());

        let mut q = query();
        q.end = q.start;
        assert!(matches!(q.validate(), Err(AggregationError::InvalidRange { .. })));

        assert!(matches!(
            query().with_limit(0).validate(),
            Err(AggregationError::InvalidParameter { .. })
        ));

        let mut q = query();
        q.entity_ids.push(EntityId::new(" "));
        assert!(matches!(q.validate(), Err(AggregationError::MalformedEntitySet(_))));
    }

    #[test]
    fn test_bucket_cap_applies_to_every_grouping() {
        for grouping in [GroupingUnit::Hour, GroupingUnit::Day, GroupingUnit::Week] {
            let start = grouping.align(day(1));
            let at_cap = start + grouping.step() * 10;
            let q = AggregationQuery::new(["a"], start, at_cap, grouping, Metric::Count);
            assert_eq!(q.bucket_count(), 10);
            assert!(q.validate_within(10).is_ok());

            let over = AggregationQuery::new(["a"], start, at_cap + Duration::seconds(1), grouping, Metric::Count);
            assert_eq!(over.bucket_count(), 11);
            assert!(matches!(
                over.validate_within(10),
                Err(AggregationError::InvalidParameter { ref param, .. }) if param == "range"
            ));
        }
    }

    #[test]
    fn test_bucket_count_matches_bucket_starts() {
        let start = day(3) + Duration::minutes(90);
        let end = day(20) + Duration::milliseconds(1);
        for grouping in [GroupingUnit::Hour, GroupingUnit::Day, GroupingUnit::Week] {
            let q = AggregationQuery::new(["a"], start, end, grouping, Metric::Count);
            assert_eq!(q.bucket_count(), grouping.bucket_starts(start, end).len() as u64);
        }
    }

    #[test]
    fn test_millennia_of_hours_rejected_without_allocating() {
        let start = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap();
        let q = AggregationQuery::new(["a"], start, end, GroupingUnit::Hour, Metric::Count);
        assert!(q.bucket_count() > 87_000_000);
        assert!(q.validate_within(10_000).is_err());
    }

    #[test]
    fn test_unique_entities_keeps_first_occurrence() {
        let q = AggregationQuery::new(["b", "a", "b", "c", "a"], day(1), day(2), GroupingUnit::Day, Metric::Count);
        let unique = q.unique_entities();
        assert_eq!(unique, vec![EntityId::new("b"), EntityId::new("a"), EntityId::new("c")]);
    }
}
