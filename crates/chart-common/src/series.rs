//! Chart-ready series produced by aggregation.

use serde::{Deserialize, Serialize};

/// One named line/bar group with a value per label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub values: Vec<f64>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Ordered bucket labels plus datasets aligned to them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
}

impl ChartSeries {
    pub fn new(labels: Vec<String>, datasets: Vec<Dataset>) -> Self {
        Self { labels, datasets }
    }

    /// Largest single value across all datasets (0 when empty).
    pub fn max_value(&self) -> f64 {
        self.datasets
            .iter()
            .flat_map(|d| d.values.iter().copied())
            .fold(0.0, f64::max)
    }

    /// Largest per-label sum across datasets, used by stacked charts.
    pub fn max_stacked_value(&self) -> f64 {
        (0..self.labels.len())
            .map(|i| {
                self.datasets
                    .iter()
                    .map(|d| d.values.get(i).copied().unwrap_or(0.0).max(0.0))
                    .sum::<f64>()
            })
            .fold(0.0, f64::max)
    }

    /// Check that every dataset is aligned to the labels and finite.
    pub fn validate(&self) -> Result<(), String> {
        for dataset in &self.datasets {
            if dataset.values.len() != self.labels.len() {
                return Err(format!(
                    "dataset '{}' has {} values for {} labels",
                    dataset.name,
                    dataset.values.len(),
                    self.labels.len()
                ));
            }
            if let Some(bad) = dataset.values.iter().find(|v| !v.is_finite()) {
                return Err(format!("dataset '{}' contains non-finite value {}", dataset.name, bad));
            }
        }
        Ok(())
    }
}
