//! Deterministic cache keys.
//!
//! Keys are derived from a canonical JSON form of the request parameters:
//! entity ids are sorted and de-duplicated, timestamps use a fixed
//! millisecond serialization and object fields are emitted in sorted order.
//! The canonical bytes are hashed with BLAKE3 and the first 16 bytes of the
//! digest are hex encoded:
//!
//! ```text
//! {prefix}:{namespace}:{digest}
//! ```
//!
//! Invalidation needs to know which entities and which time span an entry
//! was derived from, so a [`CacheKey`] carries both alongside the key string.
//! The cache layer uses them to write index entries:
//!
//! ```text
//! {prefix}:idx:ent:{hex(entity)}:{namespace}:{digest}
//! {prefix}:idx:span:{namespace}:{digest}:{start_millis}:{end_millis}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use chart_common::{normalize_timestamp, EntityId};

/// Bytes of the BLAKE3 digest kept in a key.
const DIGEST_BYTES: usize = 16;

pub const DEFAULT_PREFIX: &str = "charts";

/// Cache partition, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    RawQuery,
    AggregatedData,
    Series,
    RenderedImage,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::RawQuery,
        Namespace::AggregatedData,
        Namespace::Series,
        Namespace::RenderedImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::RawQuery => "raw",
            Namespace::AggregatedData => "agg",
            Namespace::Series => "series",
            Namespace::RenderedImage => "image",
        }
    }

    fn index(&self) -> usize {
        match self {
            Namespace::RawQuery => 0,
            Namespace::AggregatedData => 1,
            Namespace::Series => 2,
            Namespace::RenderedImage => 3,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| format!("unknown cache namespace '{}'", s))
    }
}

pub(crate) fn namespace_slot(ns: Namespace) -> usize {
    ns.index()
}

/// Parameters a cache key is derived from.
///
/// Field insertion order never affects the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyParams {
    entities: BTreeSet<EntityId>,
    span: Option<(DateTime<Utc>, DateTime<Utc>)>,
    fields: BTreeMap<String, Value>,
}

impl KeyParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entity ids. Order and duplicates are irrelevant.
    pub fn entities<I, E>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.entities.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Time span the entry covers.
    pub fn span(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.span = Some((start, end));
        self
    }

    /// Any other scalar parameter.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Fingerprint of a serializable options value, stored as the `options` field.
    pub fn options<T: Serialize>(self, options: &T) -> Self {
        let fingerprint = fingerprint(options);
        self.field("options", fingerprint)
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut canonical: BTreeMap<&str, Value> = BTreeMap::new();
        canonical.insert(
            "entities",
            Value::Array(
                self.entities
                    .iter()
                    .map(|id| Value::String(id.as_str().to_string()))
                    .collect(),
            ),
        );
        if let Some((start, end)) = self.span {
            canonical.insert("start", Value::String(normalize_timestamp(start)));
            canonical.insert("end", Value::String(normalize_timestamp(end)));
        }
        let fields: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        canonical.insert("fields", Value::Object(fields));

        // BTreeMap of JSON values always serializes.
        serde_json::to_vec(&canonical).unwrap_or_default()
    }
}

/// Hex digest of a serializable value, used for option fingerprints.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    // Going through `Value` sorts object keys.
    let bytes = match serde_json::to_value(value).and_then(|v| serde_json::to_vec(&v)) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Options could not be serialized for fingerprinting");
            Vec::new()
        }
    };
    digest(&bytes)
}

fn digest(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hex::encode(&hash.as_bytes()[..DIGEST_BYTES])
}

/// A derived cache key plus the dependencies recorded for invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    key: String,
    namespace: Namespace,
    digest: String,
    entities: Vec<EntityId>,
    tags: Vec<EntityId>,
    span: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.span
    }

    /// Tag the entry with extra entities it depends on without changing the key.
    ///
    /// Used for entries computed from an expanded entity set: invalidating a
    /// related entity must also drop them.
    pub fn with_tags<I, E>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Every entity the entry depends on, sorted and de-duplicated.
    pub fn referenced_entities(&self) -> BTreeSet<&EntityId> {
        self.entities.iter().chain(self.tags.iter()).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Parsed span index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanIndex {
    pub target: String,
    pub start_millis: i64,
    pub end_millis: i64,
}

/// Builds cache keys and index entries under one prefix.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    prefix: String,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeyDeriver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the key for `params` in `namespace`.
    pub fn derive(&self, namespace: Namespace, params: &KeyParams) -> CacheKey {
        let digest = digest(&params.canonical_bytes());
        CacheKey {
            key: self.entry_key(namespace, &digest),
            namespace,
            digest,
            entities: params.entities.iter().cloned().collect(),
            tags: Vec::new(),
            span: params.span,
        }
    }

    pub fn entry_key(&self, namespace: Namespace, digest: &str) -> String {
        format!("{}:{}:{}", self.prefix, namespace, digest)
    }

    pub fn entity_index_key(&self, entity: &EntityId, key: &CacheKey) -> String {
        format!(
            "{}:idx:ent:{}:{}:{}",
            self.prefix,
            hex::encode(entity.as_str()),
            key.namespace,
            key.digest
        )
    }

    pub fn span_index_key(&self, key: &CacheKey) -> Option<String> {
        key.span.map(|(start, end)| {
            format!(
                "{}:idx:span:{}:{}:{}:{}",
                self.prefix,
                key.namespace,
                key.digest,
                start.timestamp_millis(),
                end.timestamp_millis()
            )
        })
    }

    pub fn entity_index_pattern(&self, entity: &EntityId) -> String {
        format!("{}:idx:ent:{}:*", self.prefix, hex::encode(entity.as_str()))
    }

    pub fn span_index_pattern(&self) -> String {
        format!("{}:idx:span:*", self.prefix)
    }

    pub fn all_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    pub fn is_index_key(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with(":idx:"))
    }

    /// Entry key an entity index entry points at.
    pub fn parse_entity_index(&self, index_key: &str) -> Option<String> {
        let rest = index_key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(":idx:ent:")?;
        let mut parts = rest.splitn(3, ':');
        let _entity = parts.next()?;
        let namespace: Namespace = parts.next()?.parse().ok()?;
        let digest = parts.next()?;
        Some(self.entry_key(namespace, digest))
    }

    /// Entry key and span recorded by a span index entry.
    pub fn parse_span_index(&self, index_key: &str) -> Option<SpanIndex> {
        let rest = index_key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(":idx:span:")?;
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 4 {
            return None;
        }
        let namespace: Namespace = parts[0].parse().ok()?;
        Some(SpanIndex {
            target: self.entry_key(namespace, parts[1]),
            start_millis: parts[2].parse().ok()?,
            end_millis: parts[3].parse().ok()?,
        })
    }
}
