//! Common test fixtures for activity-charts tests.
//!
//! All times are anchored on Monday 2024-01-01 00:00 UTC so day, hour and
//! week buckets line up with easy-to-read labels.

use chrono::{DateTime, Duration, TimeZone, Utc};

use chart_common::{ActivityKind, ActivityRecord, ChartSeries, Dataset, EntityId};

/// Monday 2024-01-01 00:00:00 UTC.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Midnight of the `n`-th day of the fixture week (day 1 is the base time).
pub fn day(n: i64) -> DateTime<Utc> {
    base_time() + Duration::days(n - 1)
}

/// `hour` o'clock on fixture day `n`.
pub fn at(n: i64, hour: i64) -> DateTime<Utc> {
    day(n) + Duration::hours(hour)
}

pub fn ids(names: &[&str]) -> Vec<EntityId> {
    names.iter().map(|n| EntityId::new(*n)).collect()
}

pub fn kill(entity: &str, ts: DateTime<Utc>) -> ActivityRecord {
    ActivityRecord::new(entity, ts, ActivityKind::Kill)
}

pub fn loss(entity: &str, ts: DateTime<Utc>) -> ActivityRecord {
    ActivityRecord::new(entity, ts, ActivityKind::Loss)
}

pub fn map_activity(entity: &str, ts: DateTime<Utc>) -> ActivityRecord {
    ActivityRecord::new(entity, ts, ActivityKind::Map)
}

/// Records of the canonical example week: three kills for `A` on day 2 and
/// one for `B` on day 5.
pub fn example_week_records() -> Vec<ActivityRecord> {
    vec![
        kill("A", at(2, 3)).with_value(100.0).with_points(10.0).with_involved(2),
        kill("A", at(2, 9)).with_value(50.0).with_points(5.0).with_involved(1),
        kill("A", at(2, 21)).with_value(25.0).with_points(1.0).with_involved(4),
        kill("B", at(5, 12)).with_value(900.0).with_points(40.0).with_involved(12),
    ]
}

/// A small, valid two-dataset series.
pub fn sample_series() -> ChartSeries {
    ChartSeries::new(
        vec![
            "2024-01-01".into(),
            "2024-01-02".into(),
            "2024-01-03".into(),
            "2024-01-04".into(),
        ],
        vec![
            Dataset::new("A", vec![1.0, 3.0, 0.0, 2.0]),
            Dataset::new("B", vec![0.0, 1.0, 4.0, 1.0]),
        ],
    )
}
