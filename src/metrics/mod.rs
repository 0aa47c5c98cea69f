use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

pub mod aggregator;
#[cfg(test)]
pub mod fake;
pub mod prometheus;

#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub expr: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    pub labels: HashMap<String, String>,
    /// `(unix seconds, value)` in backend order.
    pub samples: Vec<(i64, f64)>,
}

/// Outcome of parsing a backend payload. Instant vectors are normalised to
/// single-sample series so both query kinds share one shape.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Matrix(Vec<Series>),
    Empty,
    Malformed(String),
}

impl QueryResult {
    pub fn into_series(self) -> Result<Vec<Series>, AppError> {
        match self {
            QueryResult::Matrix(series) => Ok(series),
            QueryResult::Empty => Ok(Vec::new()),
            QueryResult::Malformed(reason) => Err(AppError::MalformedResponse(reason)),
        }
    }

    /// Sums every series at each timestamp. Non-finite samples are skipped and
    /// negative ones count as zero.
    pub fn flatten(self) -> Result<BTreeMap<i64, f64>, AppError> {
        let mut out = BTreeMap::new();
        for series in self.into_series()? {
            for (ts, value) in series.samples {
                if !value.is_finite() {
                    continue;
                }
                *out.entry(ts).or_insert(0.0) += value.max(0.0);
            }
        }
        Ok(out)
    }

    /// Latest value per distinct `label`, for instant queries grouped by host.
    pub fn latest_by_label(self, label: &str) -> Result<HashMap<String, f64>, AppError> {
        let mut out = HashMap::new();
        for series in self.into_series()? {
            let Some(key) = series.labels.get(label) else {
                continue;
            };
            if let Some((_, value)) = series.samples.last() {
                if value.is_finite() {
                    out.insert(key.clone(), *value);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
pub trait MetricsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn range_query(&self, query: &RangeQuery) -> Result<QueryResult, AppError>;

    async fn instant_query(&self, expr: &str) -> Result<QueryResult, AppError>;

    /// Cheap connectivity check; returns the HTTP status when there is one.
    async fn probe(&self) -> Result<Option<u16>, AppError> {
        self.instant_query("vector(1)").await.map(|_| None)
    }
}

/// Stand-in when no backend URL is configured: every call fails as unavailable.
pub struct UnconfiguredBackend;

#[async_trait]
impl MetricsBackend for UnconfiguredBackend {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn range_query(&self, _query: &RangeQuery) -> Result<QueryResult, AppError> {
        Err(AppError::UpstreamUnavailable(
            "metrics.base_url is not configured".into(),
        ))
    }

    async fn instant_query(&self, _expr: &str) -> Result<QueryResult, AppError> {
        Err(AppError::UpstreamUnavailable(
            "metrics.base_url is not configured".into(),
        ))
    }
}
