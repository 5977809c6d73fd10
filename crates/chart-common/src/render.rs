//! Render options and render tasks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, RenderError};
use crate::series::ChartSeries;

/// Largest accepted image edge in pixels.
pub const MAX_DIMENSION: u32 = 4096;

/// Supported chart kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    #[default]
    Line,
    Bar,
    StackedBar,
    Area,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Line => "line",
            ChartKind::Bar => "bar",
            ChartKind::StackedBar => "stacked_bar",
            ChartKind::Area => "area",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "line" => Ok(ChartKind::Line),
            "bar" => Ok(ChartKind::Bar),
            "stacked_bar" | "stacked" => Ok(ChartKind::StackedBar),
            "area" => Ok(ChartKind::Area),
            other => Err(PipelineError::InvalidRequest(format!(
                "unsupported chart kind '{}'",
                other
            ))),
        }
    }
}

/// How a series is drawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderOptions {
    pub kind: ChartKind,
    pub width: u32,
    pub height: u32,
    /// Chart title, carried through for callers that label images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default = "default_true")]
    pub show_grid: bool,
    #[serde(default = "default_true")]
    pub show_legend: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            kind: ChartKind::Line,
            width: 800,
            height: 400,
            title: None,
            show_grid: true,
            show_legend: true,
        }
    }
}

impl RenderOptions {
    pub fn new(kind: ChartKind, width: u32, height: u32) -> Self {
        Self {
            kind,
            width,
            height,
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(RenderError::InvalidPayload(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_DIMENSION, value
                )));
            }
        }
        Ok(())
    }
}

/// One unit of work for the render pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderTask {
    pub id: Uuid,
    pub series: ChartSeries,
    pub options: RenderOptions,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

impl RenderTask {
    pub fn new(series: ChartSeries, options: RenderOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            width: options.width,
            height: options.height,
            series,
            options,
            created_at: Utc::now(),
        }
    }

    /// Reject payloads no worker could encode.
    pub fn validate(&self) -> Result<(), RenderError> {
        self.options.validate()?;
        if self.width != self.options.width || self.height != self.options.height {
            return Err(RenderError::InvalidPayload(format!(
                "task size {}x{} disagrees with options {}x{}",
                self.width, self.height, self.options.width, self.options.height
            )));
        }
        self.series.validate().map_err(RenderError::InvalidPayload)
    }
}
