use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RangeKey {
    Day,
    Month,
    Year,
}

impl RangeKey {
    pub const ALL: [RangeKey; 3] = [RangeKey::Day, RangeKey::Month, RangeKey::Year];

    pub fn as_label(self) -> &'static str {
        match self {
            RangeKey::Day => "day",
            RangeKey::Month => "month",
            RangeKey::Year => "year",
        }
    }

    pub fn bin_count(self) -> usize {
        match self {
            RangeKey::Day => 24,
            RangeKey::Month => 30,
            RangeKey::Year => 12,
        }
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for RangeKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(RangeKey::Day),
            "month" => Ok(RangeKey::Month),
            "year" => Ok(RangeKey::Year),
            _ => Err(AppError::InvalidRange(s.to_string())),
        }
    }
}

/// Hardware assumptions used to turn utilisation into watts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PowerSpec {
    pub cpu_count: u32,
    pub cpu_tdp_w: f64,
    pub gpu_count: u32,
    pub gpu_tdp_w: f64,
    pub ram_w: f64,
    pub other_w: f64,
}

impl Default for PowerSpec {
    fn default() -> Self {
        Self {
            cpu_count: 12,
            cpu_tdp_w: 12.0,
            gpu_count: 0,
            gpu_tdp_w: 250.0,
            ram_w: 20.0,
            other_w: 30.0,
        }
    }
}

impl PowerSpec {
    pub fn validate(self) -> Result<Self, AppError> {
        let fields = [
            ("cpu_tdp_w", self.cpu_tdp_w),
            ("gpu_tdp_w", self.gpu_tdp_w),
            ("ram_w", self.ram_w),
            ("other_w", self.other_w),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::InvalidSpec(format!(
                    "{name} must be a finite, non-negative number (got {value})"
                )));
            }
        }
        // -0.0 + 0.0 == +0.0, so both zeros serialise identically.
        Ok(Self {
            cpu_tdp_w: self.cpu_tdp_w + 0.0,
            gpu_tdp_w: self.gpu_tdp_w + 0.0,
            ram_w: self.ram_w + 0.0,
            other_w: self.other_w + 0.0,
            ..self
        })
    }

    pub fn with_overrides(self, overrides: &SpecOverrides) -> Result<Self, AppError> {
        Self {
            cpu_count: overrides.cpu_count.unwrap_or(self.cpu_count),
            cpu_tdp_w: overrides.cpu_tdp_w.unwrap_or(self.cpu_tdp_w),
            gpu_count: overrides.gpu_count.unwrap_or(self.gpu_count),
            gpu_tdp_w: overrides.gpu_tdp_w.unwrap_or(self.gpu_tdp_w),
            ram_w: overrides.ram_w.unwrap_or(self.ram_w),
            other_w: overrides.other_w.unwrap_or(self.other_w),
        }
        .validate()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpecOverrides {
    pub cpu_count: Option<u32>,
    pub cpu_tdp_w: Option<f64>,
    pub gpu_count: Option<u32>,
    pub gpu_tdp_w: Option<f64>,
    pub ram_w: Option<f64>,
    pub other_w: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSeries {
    pub labels: Vec<String>,
    pub kwh: Vec<f64>,
}

impl UsageSeries {
    pub fn new(labels: Vec<String>, kwh: Vec<f64>) -> Result<Self, AppError> {
        if labels.len() != kwh.len() {
            return Err(AppError::MalformedResponse(format!(
                "series has {} labels but {} values",
                labels.len(),
                kwh.len()
            )));
        }
        Ok(Self { labels, kwh })
    }

    pub fn total_kwh(&self) -> f64 {
        self.kwh.iter().sum()
    }

    pub fn is_consistent_with(&self, stored_total: f64) -> bool {
        let total = self.total_kwh();
        self.labels.len() == self.kwh.len()
            && (total - stored_total).abs() <= 1e-6 * total.abs().max(1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeriesOrigin {
    Live,
    Synthetic,
}

impl SeriesOrigin {
    pub fn as_label(self) -> &'static str {
        match self {
            SeriesOrigin::Live => "live",
            SeriesOrigin::Synthetic => "synthetic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "live" => Some(SeriesOrigin::Live),
            "synthetic" => Some(SeriesOrigin::Synthetic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: String,
    pub range: RangeKey,
    pub spec_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: Option<i64>,
    pub source: String,
    pub range_key: RangeKey,
    pub spec_hash: String,
    pub spec: PowerSpec,
    pub origin: SeriesOrigin,
    pub series: UsageSeries,
    pub total_kwh: f64,
    pub window_start_unix: i64,
    pub window_end_unix: i64,
    pub step_seconds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            source: self.source.clone(),
            range: self.range_key,
            spec_hash: self.spec_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IntensityReading {
    pub g_per_kwh: f64,
    pub from: Option<DateTime<Utc>>,
    pub actual: bool,
}
