//! Key-value store abstraction backing the chart cache.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use chart_common::CacheError;

/// Generic get/set/delete/ttl/pattern-scan store.
///
/// Implementations are shared between concurrent requests and must be
/// internally synchronized. Patterns use Redis glob syntax (`*` and `?`).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value, `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Store a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// All live keys matching `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Remaining lifetime of a key, `None` when missing.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;
}

/// Match `text` against a glob pattern supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    // Position of the last `*` seen and the text index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
