//! Metrics a series can chart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

/// Which accumulator of an entity's activity is plotted and ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Number of records.
    Count,
    /// Sum of record values.
    Value,
    /// Sum of record points.
    Points,
    /// Sum of the secondary (participant) counts.
    Involved,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Count => "count",
            Metric::Value => "value",
            Metric::Points => "points",
            Metric::Involved => "involved",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" | "kills" | "events" => Ok(Metric::Count),
            "value" | "isk" => Ok(Metric::Value),
            "points" | "score" => Ok(Metric::Points),
            "involved" | "participants" => Ok(Metric::Involved),
            other => Err(AggregationError::UnknownMetric(other.to_string())),
        }
    }
}
