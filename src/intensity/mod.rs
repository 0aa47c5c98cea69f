use crate::error::AppError;
use crate::models::IntensityReading;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub mod national_grid;

/// Grid carbon intensity in gCO2e/kWh.
#[async_trait]
pub trait IntensitySource: Send + Sync {
    async fn current(&self) -> Result<IntensityReading, AppError>;

    async fn at(&self, ts: DateTime<Utc>) -> Result<IntensityReading, AppError>;
}

/// Memoises `current()` and never fails: on error it serves the last good
/// reading, or a configured default when there has never been one.
pub struct IntensityCache {
    source: Arc<dyn IntensitySource>,
    ttl: Duration,
    default_g_per_kwh: f64,
    last_good: Mutex<Option<(IntensityReading, DateTime<Utc>)>>,
}

impl IntensityCache {
    pub fn new(source: Arc<dyn IntensitySource>, ttl: Duration, default_g_per_kwh: f64) -> Self {
        Self {
            source,
            ttl,
            default_g_per_kwh,
            last_good: Mutex::new(None),
        }
    }

    pub async fn current(&self) -> IntensityReading {
        self.current_at(Utc::now()).await
    }

    pub async fn current_at(&self, now: DateTime<Utc>) -> IntensityReading {
        let cached = self.last_good.lock().ok().and_then(|slot| *slot);
        if let Some((reading, fetched_at)) = cached {
            if now - fetched_at < self.ttl {
                return reading;
            }
        }

        match self.source.current().await.and_then(usable) {
            Ok(reading) => {
                if let Ok(mut slot) = self.last_good.lock() {
                    *slot = Some((reading, now));
                }
                reading
            }
            Err(err) => {
                warn!(error = %err, "carbon intensity lookup failed");
                self.fallback(cached)
            }
        }
    }

    /// Reading for the half-hour slot containing `ts`. Historical readings are
    /// not memoised; failures degrade the same way `current_at` does.
    pub async fn at(&self, ts: DateTime<Utc>) -> IntensityReading {
        match self.source.at(ts).await.and_then(usable) {
            Ok(reading) => reading,
            Err(err) => {
                warn!(at = %ts, error = %err, "carbon intensity slot lookup failed");
                let cached = self.last_good.lock().ok().and_then(|slot| *slot);
                self.fallback(cached)
            }
        }
    }

    fn fallback(&self, cached: Option<(IntensityReading, DateTime<Utc>)>) -> IntensityReading {
        match cached {
            Some((reading, _)) => reading,
            None => {
                debug!(default = self.default_g_per_kwh, "using default carbon intensity");
                IntensityReading {
                    g_per_kwh: self.default_g_per_kwh,
                    from: None,
                    actual: false,
                }
            }
        }
    }
}

fn usable(reading: IntensityReading) -> Result<IntensityReading, AppError> {
    if reading.g_per_kwh.is_finite() && reading.g_per_kwh >= 0.0 {
        Ok(reading)
    } else {
        Err(AppError::MalformedResponse(format!(
            "carbon intensity out of range: {}",
            reading.g_per_kwh
        )))
    }
}
