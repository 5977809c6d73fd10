//! Redis-backed cache store.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::debug;

use chart_common::CacheError;

use crate::store::CacheStore;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// Redis cache store client.
///
/// The multiplexed connection is cheap to clone, so every operation works
/// on its own handle and no client-side lock is needed.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Unreachable(format!("Redis connection failed: {}", e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unreachable(format!("Redis connection failed: {}", e)))?;

        debug!(url = %redis_url, "Connected to Redis cache store");
        Ok(Self { conn })
    }
}

fn command_error(op: &str, e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        CacheError::Unreachable(format!("{} failed: {}", op, e))
    } else {
        CacheError::Command(format!("{} failed: {}", op, e))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.conn.clone();
        let result: Option<Vec<u8>> = conn.get(key).await.map_err(|e| command_error("GET", e))?;
        Ok(result.map(Bytes::from))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry.
        let secs = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key, value, secs)
            .await
            .map_err(|e| command_error("SETEX", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(|e| command_error("DEL", e))?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("SCAN", e))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn.ttl(key).await.map_err(|e| command_error("TTL", e))?;
        // -2: missing, -1: no expiry.
        Ok(match secs {
            -2 => None,
            -1 => Some(Duration::MAX),
            s => Some(Duration::from_secs(s.max(0) as u64)),
        })
    }
}
