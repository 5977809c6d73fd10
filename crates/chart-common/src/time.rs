//! Time bucketing for activity series.
//!
//! All buckets are aligned in UTC:
//! - hour: top of the hour
//! - day: midnight
//! - week: Monday midnight (ISO week)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

/// Width of a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingUnit {
    Hour,
    Day,
    Week,
}

impl GroupingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingUnit::Hour => "hour",
            GroupingUnit::Day => "day",
            GroupingUnit::Week => "week",
        }
    }

    /// Length of one bucket.
    pub fn step(&self) -> Duration {
        match self {
            GroupingUnit::Hour => Duration::hours(1),
            GroupingUnit::Day => Duration::days(1),
            GroupingUnit::Week => Duration::weeks(1),
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let offset = match self {
            GroupingUnit::Hour => secs.rem_euclid(SECONDS_PER_HOUR),
            GroupingUnit::Day => secs.rem_euclid(SECONDS_PER_DAY),
            GroupingUnit::Week => {
                // 1970-01-01 was a Thursday, three days after a Monday.
                let days = secs.div_euclid(SECONDS_PER_DAY);
                secs.rem_euclid(SECONDS_PER_DAY) + (days + 3).rem_euclid(7) * SECONDS_PER_DAY
            }
        };
        ts - Duration::seconds(offset) - Duration::nanoseconds(ts.timestamp_subsec_nanos() as i64)
    }

    /// Display label of the bucket starting at `bucket_start`.
    pub fn label(&self, bucket_start: DateTime<Utc>) -> String {
        match self {
            GroupingUnit::Hour => bucket_start.format("%Y-%m-%d %H:00").to_string(),
            GroupingUnit::Day => bucket_start.format("%Y-%m-%d").to_string(),
            GroupingUnit::Week => {
                let week = bucket_start.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }

    /// Contiguous bucket starts covering `[align(start), end)`.
    pub fn bucket_starts(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let step = self.step();
        let mut starts = Vec::new();
        let mut cursor = self.align(start);
        while cursor < end {
            starts.push(cursor);
            cursor = cursor + step;
        }
        starts
    }

    /// Number of buckets `bucket_starts` would produce, without allocating them.
    pub fn bucket_count(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        let span = end - self.align(start);
        if span <= Duration::zero() {
            return 0;
        }
        let secs = span.num_seconds();
        let step = self.step().num_seconds();
        let partial = secs % step != 0 || span > Duration::seconds(secs);
        (secs / step) as u64 + u64::from(partial)
    }

    /// Labels for every bucket in `[align(start), end)`.
    pub fn labels(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
        self.bucket_starts(start, end)
            .into_iter()
            .map(|ts| self.label(ts))
            .collect()
    }
}

impl fmt::Display for GroupingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingUnit {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" | "h" => Ok(GroupingUnit::Hour),
            "day" | "daily" | "d" => Ok(GroupingUnit::Day),
            "week" | "weekly" | "w" => Ok(GroupingUnit::Week),
            other => Err(AggregationError::UnknownGrouping(other.to_string())),
        }
    }
}

/// Fixed serialization used wherever a timestamp feeds a cache key.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
