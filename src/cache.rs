//! Memoised usage series keyed by `(source, range, spec hash)`.
//!
//! Rows are append-only: a recomputation always inserts a new entry and
//! readers take the most recently updated one. Concurrent misses for the same
//! key are coalesced behind a per-key async lock.

use crate::bucketing::TimeWindow;
use crate::error::AppError;
use crate::metrics::aggregator::MetricsAggregator;
use crate::models::{CacheEntry, CacheKey, PowerSpec, RangeKey, SeriesOrigin};
use crate::power::spec_hash;
use crate::synthetic;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub trait CacheStore: Send {
    /// Most recently updated consistent entry for `key`.
    fn latest_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AppError>;

    /// Appends `entry` and returns its row id.
    fn insert_entry(&mut self, entry: &CacheEntry) -> Result<i64, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlPolicy {
    pub day: Duration,
    pub month: Duration,
    pub year: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            day: Duration::hours(1),
            month: Duration::hours(24),
            year: Duration::hours(24),
        }
    }
}

impl TtlPolicy {
    pub fn ttl(&self, range: RangeKey) -> Duration {
        match range {
            RangeKey::Day => self.day,
            RangeKey::Month => self.month,
            RangeKey::Year => self.year,
        }
    }

    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.updated_at < self.ttl(entry.range_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve whatever has been computed, never compute.
    CacheOnly,
    #[default]
    ComputeOnMiss,
}

#[derive(Debug, Clone)]
pub struct UsageRequest {
    pub source: String,
    pub range: RangeKey,
    pub spec: PowerSpec,
    pub mode: CacheMode,
    pub force: bool,
}

pub struct CacheManager<S: CacheStore> {
    store: Mutex<S>,
    aggregator: MetricsAggregator,
    ttl: TtlPolicy,
    in_flight: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: CacheStore> CacheManager<S> {
    pub fn new(store: S, aggregator: MetricsAggregator, ttl: TtlPolicy) -> Self {
        Self {
            store: Mutex::new(store),
            aggregator,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_compute(&self, req: &UsageRequest) -> Result<CacheEntry, AppError> {
        self.get_or_compute_at(req, Utc::now()).await
    }

    pub async fn get_or_compute_at(
        &self,
        req: &UsageRequest,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, AppError> {
        let spec = req.spec.validate()?;
        let key = CacheKey {
            source: req.source.clone(),
            range: req.range,
            spec_hash: spec_hash(&spec),
        };

        if req.mode == CacheMode::CacheOnly {
            return self.latest(&key)?.ok_or_else(|| AppError::CacheMiss {
                source_name: key.source.clone(),
                range: key.range.to_string(),
                spec_hash: key.spec_hash.clone(),
            });
        }

        if !req.force {
            if let Some(entry) = self.fresh_entry(&key, now)? {
                return Ok(entry);
            }
        }

        let flight = self.flight_lock(&key)?;
        let result = {
            let _guard = flight.lock().await;
            self.refresh_locked(&key, &spec, req.force, now).await
        };
        self.release_flight(&key, &flight);
        result
    }

    async fn refresh_locked(
        &self,
        key: &CacheKey,
        spec: &PowerSpec,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, AppError> {
        // Another caller may have filled the key while we waited.
        if !force {
            if let Some(entry) = self.fresh_entry(key, now)? {
                debug!(source = %key.source, range = %key.range, "served by concurrent computation");
                return Ok(entry);
            }
        }

        let entry = self.compute(key, spec, now).await?;
        Ok(self.persist(entry))
    }

    fn latest(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AppError> {
        let store = self
            .store
            .lock()
            .map_err(|_| AppError::PersistenceFailure("cache store lock poisoned".into()))?;
        store.latest_entry(key)
    }

    fn fresh_entry(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        Ok(self
            .latest(key)?
            .filter(|entry| self.ttl.is_fresh(entry, now)))
    }

    /// Recoverable upstream errors are answered with the synthetic series for
    /// the key; anything else (a bad backend URL, say) is returned as is.
    async fn compute(
        &self,
        key: &CacheKey,
        spec: &PowerSpec,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, AppError> {
        let window = TimeWindow::build(key.range, now);
        let (series, origin) = match self
            .aggregator
            .aggregate_live(&key.source, key.range, spec, now)
            .await
        {
            Ok(series) => (series, SeriesOrigin::Live),
            Err(err) if err.is_recoverable() => {
                if matches!(err, AppError::UnknownSource(_)) {
                    debug!(source = %key.source, "source is not backend-eligible, using synthetic series");
                } else {
                    warn!(
                        source = %key.source,
                        range = %key.range,
                        error = %err,
                        "live aggregation failed, falling back to synthetic series"
                    );
                }
                let seed = synthetic::fallback_seed(&key.source, key.range);
                (
                    synthetic::generate(key.range, spec, seed),
                    SeriesOrigin::Synthetic,
                )
            }
            Err(err) => return Err(err),
        };

        Ok(CacheEntry {
            id: None,
            source: key.source.clone(),
            range_key: key.range,
            spec_hash: key.spec_hash.clone(),
            spec: *spec,
            origin,
            total_kwh: series.total_kwh(),
            series,
            window_start_unix: window.start.timestamp(),
            window_end_unix: window.end.timestamp(),
            step_seconds: window.step_seconds,
            created_at: now,
            updated_at: now,
        })
    }

    /// Write failures are logged and swallowed; the computed entry is
    /// returned either way.
    fn persist(&self, mut entry: CacheEntry) -> CacheEntry {
        let result = self
            .store
            .lock()
            .map_err(|_| AppError::PersistenceFailure("cache store lock poisoned".into()))
            .and_then(|mut store| store.insert_entry(&entry));

        match result {
            Ok(id) => {
                info!(
                    source = %entry.source,
                    range = %entry.range_key,
                    origin = entry.origin.as_label(),
                    id,
                    total_kwh = entry.total_kwh,
                    "cache entry written"
                );
                entry.id = Some(id);
            }
            Err(err) => {
                let err = if matches!(err, AppError::PersistenceFailure(_)) {
                    err
                } else {
                    AppError::PersistenceFailure(err.to_string())
                };
                warn!(source = %entry.source, range = %entry.range_key, error = %err, "cache write failed");
            }
        }
        entry
    }

    fn flight_lock(&self, key: &CacheKey) -> Result<Arc<tokio::sync::Mutex<()>>, AppError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| AppError::PersistenceFailure("in-flight map lock poisoned".into()))?;
        Ok(in_flight.entry(key.clone()).or_default().clone())
    }

    fn release_flight(&self, key: &CacheKey, flight: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            // The map and this call hold one reference each when nobody is waiting.
            if Arc::strong_count(flight) <= 2 {
                in_flight.remove(key);
            }
        }
    }
}
