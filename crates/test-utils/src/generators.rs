//! Deterministic record generators.
//!
//! The generators avoid randomness so every test run sees the same data and
//! the expected totals can be computed by hand.

use chrono::{DateTime, Duration, Utc};

use chart_common::{ActivityKind, ActivityRecord, ChartSeries, Dataset};

/// `per_hour` records for every entity in every hour of `[start, start + hours)`.
///
/// Record `i` of an hour lands `i` minutes past the hour and alternates
/// kill/loss/map. Values are `1.0` and points `2.0`, so totals are easy to derive.
pub fn hourly_records(
    entities: &[&str],
    start: DateTime<Utc>,
    hours: i64,
    per_hour: u32,
) -> Vec<ActivityRecord> {
    let kinds = [ActivityKind::Kill, ActivityKind::Loss, ActivityKind::Map];
    let mut records = Vec::with_capacity(entities.len() * hours.max(0) as usize * per_hour as usize);
    for hour in 0..hours {
        for entity in entities {
            for i in 0..per_hour {
                let ts = start + Duration::hours(hour) + Duration::minutes(i64::from(i % 60));
                records.push(
                    ActivityRecord::new(*entity, ts, kinds[(i % 3) as usize])
                        .with_value(1.0)
                        .with_points(2.0)
                        .with_involved(1),
                );
            }
        }
    }
    records
}

/// `count` kills for `entity`, spread evenly across `[start, start + span)`.
pub fn spread_kills(entity: &str, start: DateTime<Utc>, span: Duration, count: u32) -> Vec<ActivityRecord> {
    if count == 0 {
        return Vec::new();
    }
    let step = span / count as i32;
    (0..count)
        .map(|i| ActivityRecord::new(entity, start + step * i as i32, ActivityKind::Kill).with_value(1.0))
        .collect()
}

/// A series with `datasets` datasets of `labels` points following a sawtooth.
pub fn sawtooth_series(labels: usize, datasets: usize) -> ChartSeries {
    let labels_vec = (0..labels).map(|i| format!("L{:02}", i)).collect();
    let datasets = (0..datasets)
        .map(|d| {
            let values = (0..labels).map(|i| ((i + d) % 7) as f64 * 1.5).collect();
            Dataset::new(format!("entity-{}", d), values)
        })
        .collect();
    ChartSeries::new(labels_vec, datasets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::base_time;

    #[test]
    fn test_hourly_records_count() {
        let records = hourly_records(&["a", "b"], base_time(), 24, 3);
        assert_eq!(records.len(), 2 * 24 * 3);
        assert!(records.iter().all(|r| r.timestamp >= base_time()));
        assert!(records.iter().all(|r| r.timestamp < base_time() + Duration::hours(24)));
    }

    #[test]
    fn test_spread_kills_stay_in_span() {
        let records = spread_kills("a", base_time(), Duration::days(7), 10);
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.timestamp < base_time() + Duration::days(7)));
    }

    #[test]
    fn test_sawtooth_series_is_valid() {
        let series = sawtooth_series(30, 3);
        assert_eq!(series.labels.len(), 30);
        assert!(series.validate().is_ok());
    }
}
