//! Tracked entities and the raw activity records attributed to them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

/// Opaque identifier of a tracked entity (a character, a corporation, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An id made only of whitespace cannot name an entity.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of activity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Kill,
    Loss,
    Map,
}

/// A single time-stamped activity event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    /// Monetary value of the event.
    #[serde(default)]
    pub value: f64,
    /// Score awarded for the event.
    #[serde(default)]
    pub points: f64,
    /// Secondary count, e.g. number of participants.
    #[serde(default)]
    pub involved: u32,
}

impl ActivityRecord {
    pub fn new(entity_id: impl Into<EntityId>, timestamp: DateTime<Utc>, kind: ActivityKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            kind,
            value: 0.0,
            points: 0.0,
            involved: 0,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_points(mut self, points: f64) -> Self {
        self.points = points;
        self
    }

    pub fn with_involved(mut self, involved: u32) -> Self {
        self.involved = involved;
        self
    }
}

/// Which record kinds take part in an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityFilter {
    #[default]
    All,
    Kills,
    Losses,
    Map,
}

impl ActivityFilter {
    pub fn matches(&self, kind: ActivityKind) -> bool {
        match self {
            ActivityFilter::All => true,
            ActivityFilter::Kills => kind == ActivityKind::Kill,
            ActivityFilter::Losses => kind == ActivityKind::Loss,
            ActivityFilter::Map => kind == ActivityKind::Map,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityFilter::All => "all",
            ActivityFilter::Kills => "kills",
            ActivityFilter::Losses => "losses",
            ActivityFilter::Map => "map",
        }
    }
}

impl FromStr for ActivityFilter {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(ActivityFilter::All),
            "kills" | "kill" => Ok(ActivityFilter::Kills),
            "losses" | "loss" => Ok(ActivityFilter::Losses),
            "map" | "activity" => Ok(ActivityFilter::Map),
            other => Err(AggregationError::InvalidParameter {
                param: "filter".to_string(),
                message: format!("unknown activity filter '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_serializes_as_plain_string() {
        let id = EntityId::new("char-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"char-42\"");
        assert!(EntityId::new("  ").is_blank());
    }

    #[test]
    fn test_filter_matches() {
        assert!(ActivityFilter::All.matches(ActivityKind::Map));
        assert!(ActivityFilter::Kills.matches(ActivityKind::Kill));
        assert!(!ActivityFilter::Kills.matches(ActivityKind::Loss));
        assert_eq!("Losses".parse::<ActivityFilter>().unwrap(), ActivityFilter::Losses);
        assert!("pvp".parse::<ActivityFilter>().is_err());
    }

    #[test]
    fn test_record_defaults_missing_numbers() {
        let json = r#"{"entity_id":"a","timestamp":"2024-01-02T10:00:00Z","kind":"kill"}"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.value, 0.0);
        assert_eq!(record.involved, 0);
        assert_eq!(record.kind, ActivityKind::Kill);
    }
}
