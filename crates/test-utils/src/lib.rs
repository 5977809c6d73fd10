//! Shared test utilities for the activity-charts workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Time and record fixtures anchored on a fixed Monday
//! - Deterministic record and series generators
//! - Repository and cache store doubles with failure injection
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{day, kill, FlakyRepository};
//! ```

pub mod doubles;
pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use doubles::*;
pub use fixtures::*;
pub use generators::*;

/// Write `records` as a repository snapshot file inside a fresh temp dir.
///
/// The directory is removed when the returned handle is dropped.
pub fn write_snapshot(
    snapshot: &storage::RepositorySnapshot,
) -> std::io::Result<(tempfile::TempDir, std::path::PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("records.json");
    let json = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&path, json)?;
    Ok((dir, path))
}

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Assert every value of a dataset matches `expected` within `epsilon`.
///
/// # Usage
///
/// ```ignore
/// assert_values_approx_eq!(series.datasets[0].values, [0.0, 3.0, 0.0], 1e-9);
/// ```
#[macro_export]
macro_rules! assert_values_approx_eq {
    ($values:expr, $expected:expr, $epsilon:expr) => {{
        let values: &[f64] = &$values;
        let expected: &[f64] = &$expected;
        assert_eq!(values.len(), expected.len(), "value count differs");
        for (left, right) in values.iter().zip(expected.iter()) {
            $crate::assert_approx_eq!(*left, *right, $epsilon);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_approx_eq_passes() {
        assert_approx_eq!(1.0001, 1.0, 0.001);
        assert_approx_eq!(0.0, 0.0, 0.0001);
        assert_approx_eq!(-5.5, -5.500001, 0.0001);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_assert_approx_eq_fails() {
        assert_approx_eq!(1.1, 1.0, 0.001);
    }

    #[test]
    fn test_assert_values_approx_eq_passes() {
        assert_values_approx_eq!(vec![1.0, 2.0], [1.0, 2.0000001], 0.001);
    }

    #[test]
    fn test_write_snapshot() {
        let snapshot = storage::RepositorySnapshot {
            records: example_week_records(),
            related: Default::default(),
        };
        let (_dir, path) = write_snapshot(&snapshot).unwrap();
        let repo = storage::MemoryRepository::load(&path).unwrap();
        let records = tokio_test::block_on(storage::ActivityRepository::get_records(
            &repo,
            &ids(&["A", "B"]),
            day(1),
            day(8),
        ))
        .unwrap();
        assert_eq!(records.len(), 4);
    }
}
