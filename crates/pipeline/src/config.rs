//! Pipeline configuration.
//!
//! Every struct has a `Default` with explicit values. [`PipelineConfig::from_env`]
//! overrides them from `CHARTS_*` environment variables and rejects values it
//! cannot parse instead of falling back.

use std::time::Duration;

use thiserror::Error;

use aggregation::AggregationConfig;
use storage::{TtlPolicy, DEFAULT_PREFIX};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}: {message}")]
    InvalidValue {
        var: String,
        value: String,
        message: String,
    },
}

/// Render worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Fixed number of worker slots
    pub size: usize,
    /// Hard limit on a single render task
    pub task_timeout: Duration,
    /// How long a caller waits for an idle slot
    pub queue_wait: Duration,
    /// First delay between failed replacement spawns
    pub respawn_initial_backoff: Duration,
    /// Upper bound on the replacement spawn delay
    pub respawn_max_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            task_timeout: Duration::from_secs(30),
            queue_wait: Duration::from_secs(10),
            respawn_initial_backoff: Duration::from_millis(100),
            respawn_max_backoff: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Delay before replacement spawn attempt `attempt` (1-based).
    pub fn respawn_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.respawn_initial_backoff
            .checked_mul(factor)
            .map_or(self.respawn_max_backoff, |d| d.min(self.respawn_max_backoff))
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Prefix of every cache key
    pub cache_prefix: String,
    pub ttl: TtlPolicy,
    pub aggregation: AggregationConfig,
    pub pool: PoolConfig,
    /// How long shutdown waits for in-flight requests
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_prefix: DEFAULT_PREFIX.to_string(),
            ttl: TtlPolicy::default(),
            aggregation: AggregationConfig::default(),
            pool: PoolConfig::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `CHARTS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(prefix) = env.string("CHARTS_CACHE_PREFIX")? {
            config.cache_prefix = prefix;
        }

        env.secs("CHARTS_TTL_RAW_SECS", &mut config.ttl.raw_query)?;
        env.secs("CHARTS_TTL_AGGREGATED_SECS", &mut config.ttl.aggregated_data)?;
        env.secs("CHARTS_TTL_SERIES_SECS", &mut config.ttl.series)?;
        env.secs("CHARTS_TTL_IMAGE_SECS", &mut config.ttl.rendered_image)?;

        env.count("CHARTS_EXPANSION_BATCH_SIZE", &mut config.aggregation.expansion_batch_size)?;
        env.count("CHARTS_MAX_CONCURRENT_BATCHES", &mut config.aggregation.max_concurrent_batches)?;
        env.count("CHARTS_REDUCE_CHUNK_SIZE", &mut config.aggregation.reduce_chunk_size)?;
        env.count("CHARTS_MAX_BUCKETS", &mut config.aggregation.max_buckets)?;
        if let Some(attempts) = env.parse::<u32>("CHARTS_RETRY_ATTEMPTS")? {
            if attempts == 0 {
                return Err(env.invalid("CHARTS_RETRY_ATTEMPTS", "must be at least 1"));
            }
            config.aggregation.retry.max_attempts = attempts;
        }
        env.millis("CHARTS_RETRY_BACKOFF_MS", &mut config.aggregation.retry.initial_backoff)?;
        env.millis("CHARTS_RETRY_MAX_BACKOFF_MS", &mut config.aggregation.retry.max_backoff)?;

        env.count("CHARTS_POOL_SIZE", &mut config.pool.size)?;
        env.millis("CHARTS_TASK_TIMEOUT_MS", &mut config.pool.task_timeout)?;
        env.millis("CHARTS_QUEUE_WAIT_MS", &mut config.pool.queue_wait)?;
        env.millis("CHARTS_RESPAWN_BACKOFF_MS", &mut config.pool.respawn_initial_backoff)?;
        env.millis("CHARTS_RESPAWN_MAX_BACKOFF_MS", &mut config.pool.respawn_max_backoff)?;

        env.millis("CHARTS_DRAIN_TIMEOUT_MS", &mut config.drain_timeout)?;

        Ok(config)
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Result<Option<String>, ConfigError> {
        match (self.lookup)(var) {
            Some(value) if value.trim().is_empty() => Err(self.invalid(var, "must not be empty")),
            other => Ok(other),
        }
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(var) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
                message: e.to_string(),
            }),
        }
    }

    /// Positive integer.
    fn count(&self, var: &str, target: &mut usize) -> Result<(), ConfigError> {
        if let Some(value) = self.parse::<usize>(var)? {
            if value == 0 {
                return Err(self.invalid(var, "must be at least 1"));
            }
            *target = value;
        }
        Ok(())
    }

    fn secs(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        self.duration(var, target, Duration::from_secs)
    }

    fn millis(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        self.duration(var, target, Duration::from_millis)
    }

    fn duration(&self, var: &str, target: &mut Duration, unit: fn(u64) -> Duration) -> Result<(), ConfigError> {
        if let Some(value) = self.parse::<u64>(var)? {
            if value == 0 {
                return Err(self.invalid(var, "must be greater than zero"));
            }
            *target = unit(value);
        }
        Ok(())
    }

    fn invalid(&self, var: &str, message: &str) -> ConfigError {
        ConfigError::InvalidValue {
            var: var.to_string(),
            value: (self.lookup)(var).unwrap_or_default(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.task_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.queue_wait, Duration::from_secs(10));
        assert_eq!(config.cache_prefix, "charts");
        assert_eq!(config.ttl.rendered_image, Duration::from_secs(1800));
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CHARTS_POOL_SIZE", "8"),
            ("CHARTS_TASK_TIMEOUT_MS", "1500"),
            ("CHARTS_TTL_IMAGE_SECS", "60"),
            ("CHARTS_CACHE_PREFIX", "zk"),
            ("CHARTS_RETRY_ATTEMPTS", "5"),
            ("CHARTS_MAX_BUCKETS", "2000"),
        ]))
        .unwrap();
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.pool.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.ttl.rendered_image, Duration::from_secs(60));
        assert_eq!(config.cache_prefix, "zk");
        assert_eq!(config.aggregation.retry.max_attempts, 5);
        assert_eq!(config.aggregation.max_buckets, 2000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[("CHARTS_POOL_SIZE", "four")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "CHARTS_POOL_SIZE"));

        assert!(PipelineConfig::from_lookup(lookup(&[("CHARTS_POOL_SIZE", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("CHARTS_QUEUE_WAIT_MS", "-5")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("CHARTS_CACHE_PREFIX", " ")])).is_err());
    }

    #[test]
    fn test_respawn_backoff_is_capped() {
        let pool = PoolConfig::default();
        assert_eq!(pool.respawn_backoff(1), Duration::from_millis(100));
        assert_eq!(pool.respawn_backoff(3), Duration::from_millis(400));
        assert_eq!(pool.respawn_backoff(20), Duration::from_secs(5));
        assert_eq!(pool.respawn_backoff(40), Duration::from_secs(5));
    }
}
