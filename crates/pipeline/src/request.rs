//! Chart requests and their adaptation from loose parameters.

use std::future::Future;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use aggregation::AggregationQuery;
use chart_common::{
    normalize_timestamp, ActivityFilter, ChartKind, EntityId, GroupingUnit, Metric, PipelineError,
    RenderOptions,
};
use storage::{fingerprint, KeyParams};

/// Datasets per chart when the caller does not say.
pub const DEFAULT_LIMIT: usize = 10;

/// A validated chart request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub entity_ids: Vec<EntityId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub grouping: GroupingUnit,
    pub metric: Metric,
    pub filter: ActivityFilter,
    pub limit: usize,
    pub render: RenderOptions,
}

impl ChartRequest {
    /// Request with the `All` filter and the default limit.
    pub fn new(
        entity_ids: impl IntoIterator<Item = impl Into<EntityId>>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        grouping: GroupingUnit,
        metric: Metric,
        render: RenderOptions,
    ) -> Result<Self, PipelineError> {
        let request = Self {
            entity_ids: entity_ids.into_iter().map(Into::into).collect(),
            start,
            end,
            grouping,
            metric,
            filter: ActivityFilter::All,
            limit: DEFAULT_LIMIT,
            render,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_limit(mut self, limit: usize) -> Result<Self, PipelineError> {
        self.limit = limit;
        self.validate()?;
        Ok(self)
    }

    pub fn with_filter(mut self, filter: ActivityFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Build a request from string parameters.
    ///
    /// `start`, `end`, `grouping` and `metric` are required; the rest fall back
    /// to the default limit and [`RenderOptions::default`].
    pub fn from_params(params: RawChartParams) -> Result<Self, PipelineError> {
        let start = parse_time("start", required("start", params.start.as_deref())?)?;
        let end = parse_time("end", required("end", params.end.as_deref())?)?;
        let grouping = required("grouping", params.grouping.as_deref())?.parse::<GroupingUnit>()?;
        let metric = required("metric", params.metric.as_deref())?.parse::<Metric>()?;
        let filter = match params.filter.as_deref() {
            Some(raw) => raw.parse::<ActivityFilter>()?,
            None => ActivityFilter::All,
        };
        let limit = match params.limit.as_deref() {
            Some(raw) => parse_number::<usize>("limit", raw)?,
            None => DEFAULT_LIMIT,
        };

        let mut render = RenderOptions::default();
        if let Some(kind) = params.kind.as_deref() {
            render.kind = kind.parse::<ChartKind>()?;
        }
        if let Some(width) = params.width.as_deref() {
            render.width = parse_number("width", width)?;
        }
        if let Some(height) = params.height.as_deref() {
            render.height = parse_number("height", height)?;
        }
        render.title = params.title.filter(|t| !t.trim().is_empty());

        let entity_ids = params
            .entities
            .iter()
            .flat_map(|raw| raw.split(','))
            .map(|id| EntityId::new(id.trim()))
            .collect::<Vec<_>>();

        let request = Self {
            entity_ids,
            start,
            end,
            grouping,
            metric,
            filter,
            limit,
            render,
        };
        request.validate()?;
        Ok(request)
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.query().validate()?;
        self.render
            .validate()
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))
    }

    /// The aggregation this request needs.
    pub fn query(&self) -> AggregationQuery {
        AggregationQuery::new(self.entity_ids.iter().cloned(), self.start, self.end, self.grouping, self.metric)
            .with_filter(self.filter)
            .with_limit(self.limit)
    }

    /// Key parameters of the series this request charts.
    ///
    /// The entity set is unordered, but ranking ties follow input order, so
    /// the series and image keys also carry the de-duplicated input order.
    pub fn series_params(&self) -> KeyParams {
        KeyParams::new()
            .entities(self.entity_ids.iter().cloned())
            .field("order", fingerprint(&self.query().unique_entities()))
            .span(self.start, self.end)
            .field("grouping", self.grouping.as_str())
            .field("metric", self.metric.as_str())
            .field("filter", self.filter.as_str())
            .field("limit", self.limit as u64)
    }

    /// Key parameters of the rendered image: the series plus the render options.
    pub fn image_params(&self) -> KeyParams {
        self.series_params().options(&self.render)
    }
}

fn required<'a>(param: &str, value: Option<&'a str>) -> Result<&'a str, PipelineError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PipelineError::InvalidRequest(format!("missing parameter '{}'", param)))
}

fn parse_number<T: std::str::FromStr>(param: &str, raw: &str) -> Result<T, PipelineError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| PipelineError::InvalidRequest(format!("'{}' is not a valid {}", raw, param)))
}

/// RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
fn parse_time(param: &str, raw: &str) -> Result<DateTime<Utc>, PipelineError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| PipelineError::InvalidRequest(format!("'{}' is not a valid {} time", raw, param)))
}

/// Loosely typed request parameters, as a command layer would collect them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawChartParams {
    /// Entity ids; each item may hold several comma-separated ids.
    pub entities: Vec<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub grouping: Option<String>,
    pub metric: Option<String>,
    pub filter: Option<String>,
    pub limit: Option<String>,
    pub kind: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub title: Option<String>,
}

/// Values [`with_request_defaults`] fills into missing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    /// Length of the range ending at `end` when `start` is missing.
    pub span: Duration,
    pub grouping: GroupingUnit,
    pub metric: Metric,
    pub filter: ActivityFilter,
    pub limit: usize,
    pub kind: ChartKind,
    pub width: u32,
    pub height: u32,
    /// End of the range when missing; the current time when `None`.
    pub now: Option<DateTime<Utc>>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        let render = RenderOptions::default();
        Self {
            span: Duration::days(7),
            grouping: GroupingUnit::Day,
            metric: Metric::Count,
            filter: ActivityFilter::All,
            limit: DEFAULT_LIMIT,
            kind: render.kind,
            width: render.width,
            height: render.height,
            now: None,
        }
    }
}

impl RequestDefaults {
    /// Fill every missing parameter. Present values are left untouched, even
    /// when they are invalid.
    pub fn apply(&self, params: &mut RawChartParams) {
        let end = match params.end.as_deref() {
            Some(raw) => parse_time("end", raw).ok(),
            None => {
                let now = self.now.unwrap_or_else(Utc::now);
                params.end = Some(normalize_timestamp(now));
                Some(now)
            }
        };
        if params.start.is_none() {
            if let Some(end) = end {
                params.start = Some(normalize_timestamp(end - self.span));
            }
        }

        params.grouping.get_or_insert_with(|| self.grouping.as_str().to_string());
        params.metric.get_or_insert_with(|| self.metric.as_str().to_string());
        params.filter.get_or_insert_with(|| self.filter.as_str().to_string());
        params.limit.get_or_insert_with(|| self.limit.to_string());
        params.kind.get_or_insert_with(|| self.kind.as_str().to_string());
        params.width.get_or_insert_with(|| self.width.to_string());
        params.height.get_or_insert_with(|| self.height.to_string());
    }
}

/// Fill defaults into `params`, validate them and hand the request to `handler`.
pub async fn with_request_defaults<F, Fut, T>(
    mut params: RawChartParams,
    defaults: &RequestDefaults,
    handler: F,
) -> Result<T, PipelineError>
where
    F: FnOnce(ChartRequest) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    defaults.apply(&mut params);
    let request = ChartRequest::from_params(params)?;
    handler(request).await
}
