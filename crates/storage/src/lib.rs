//! Storage abstractions for the activity chart pipeline.
//!
//! Provides:
//! - a generic key-value [`CacheStore`] with Redis and in-memory adapters
//! - deterministic cache keys ([`KeyDeriver`])
//! - the typed, best-effort [`ChartCache`] layer
//! - the [`ActivityRepository`] interface to the backing record store

pub mod cache;
pub mod keys;
pub mod memory_store;
pub mod redis_store;
pub mod repository;
pub mod store;

pub use cache::{CacheStats, ChartCache, NamespaceStats, TtlPolicy};
pub use chart_common::CacheError;
pub use keys::{fingerprint, CacheKey, KeyDeriver, KeyParams, Namespace, DEFAULT_PREFIX};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use repository::{ActivityRepository, MemoryRepository, RepositorySnapshot};
pub use store::CacheStore;
