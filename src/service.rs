use crate::cache::{CacheManager, CacheMode, UsageRequest};
use crate::config::{metrics_token, AppConfig};
use crate::error::AppError;
use crate::intensity::national_grid::NationalGridClient;
use crate::intensity::{IntensityCache, IntensitySource};
use crate::metrics::aggregator::MetricsAggregator;
use crate::metrics::prometheus::PrometheusBackend;
use crate::metrics::{MetricsBackend, UnconfiguredBackend};
use crate::models::{IntensityReading, PowerSpec, RangeKey, SpecOverrides};
use crate::storage::Storage;
use crate::sync::WorkspaceSync;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug)]
pub struct ProbeReport {
    pub backend: &'static str,
    pub status_code: Option<u16>,
    pub duration_ms: u128,
}

#[derive(Debug, Default, PartialEq)]
pub struct RefreshSummary {
    pub refreshed: Vec<(String, RangeKey)>,
    pub failed: Vec<(String, RangeKey, String)>,
}

/// Wires configuration, HTTP clients and backends into the components the
/// CLI drives.
pub struct CarbonService {
    cfg: AppConfig,
    backend: Arc<dyn MetricsBackend>,
    intensity: Arc<IntensityCache>,
}

impl CarbonService {
    pub fn new(cfg: AppConfig) -> Result<Self, AppError> {
        let backend: Arc<dyn MetricsBackend> = match cfg.metrics.base_url.as_deref() {
            Some(base_url) => {
                let client = Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .timeout(cfg.metrics.timeout())
                    .danger_accept_invalid_certs(cfg.metrics.accept_invalid_certs)
                    .build()?;
                Arc::new(PrometheusBackend::new(client, base_url, metrics_token()))
            }
            None => Arc::new(UnconfiguredBackend),
        };

        let intensity_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.intensity.timeout_seconds.max(1)))
            .build()?;
        let source = Arc::new(NationalGridClient::new(
            intensity_client,
            &cfg.intensity.base_url,
        ));

        Ok(Self::with_parts(cfg, backend, source))
    }

    pub fn with_parts(
        cfg: AppConfig,
        backend: Arc<dyn MetricsBackend>,
        intensity_source: Arc<dyn IntensitySource>,
    ) -> Self {
        let ttl = chrono::Duration::seconds(
            i64::try_from(cfg.intensity.cache_seconds)
                .unwrap_or(i64::MAX)
                .min(86_400),
        );
        let intensity = Arc::new(IntensityCache::new(
            intensity_source,
            ttl,
            cfg.intensity.default_g_per_kwh,
        ));
        Self {
            cfg,
            backend,
            intensity,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn resolve_spec(&self, overrides: &SpecOverrides) -> Result<PowerSpec, AppError> {
        self.cfg.spec.with_overrides(overrides)
    }

    pub fn cache_manager(&self, storage: Storage) -> CacheManager<Storage> {
        let aggregator = MetricsAggregator::new(
            Arc::clone(&self.backend),
            self.cfg.sources.clone(),
            self.cfg.metrics.timeout(),
        );
        CacheManager::new(storage, aggregator, self.cfg.ttl.policy())
    }

    pub fn workspace_sync(&self, storage: Storage) -> WorkspaceSync {
        WorkspaceSync::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.intensity),
            storage,
            self.cfg.spec,
            self.cfg.poll_seconds,
            self.cfg.metrics.timeout(),
        )
    }

    /// Warms the cache for every `(source, range)` pair. A failing pair is
    /// recorded and the batch moves on.
    pub async fn refresh(
        &self,
        manager: &CacheManager<Storage>,
        sources: &[String],
        ranges: &[RangeKey],
        spec: PowerSpec,
        force: bool,
        now: DateTime<Utc>,
    ) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        for source in sources {
            for &range in ranges {
                let req = UsageRequest {
                    source: source.clone(),
                    range,
                    spec,
                    mode: CacheMode::ComputeOnMiss,
                    force,
                };
                match manager.get_or_compute_at(&req, now).await {
                    Ok(entry) => {
                        info!(
                            source = %source,
                            range = %range,
                            origin = entry.origin.as_label(),
                            total_kwh = entry.total_kwh,
                            "cache warmed"
                        );
                        summary.refreshed.push((source.clone(), range));
                    }
                    Err(err) => {
                        warn!(source = %source, range = %range, error = %err, "cache refresh failed");
                        summary.failed.push((source.clone(), range, err.to_string()));
                    }
                }
            }
        }
        summary
    }

    pub async fn probe(&self) -> Result<ProbeReport, AppError> {
        let started = Instant::now();
        let status_code = self.backend.probe().await?;
        Ok(ProbeReport {
            backend: self.backend.name(),
            status_code,
            duration_ms: started.elapsed().as_millis(),
        })
    }

    pub async fn intensity(&self, at: Option<DateTime<Utc>>) -> IntensityReading {
        match at {
            Some(ts) => self.intensity.at(ts).await,
            None => self.intensity.current().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fake::FakeBackend;
    use crate::models::SeriesOrigin;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct DownIntensity;

    #[async_trait]
    impl IntensitySource for DownIntensity {
        async fn current(&self) -> Result<IntensityReading, AppError> {
            Err(AppError::UpstreamUnavailable("offline".into()))
        }

        async fn at(&self, _ts: DateTime<Utc>) -> Result<IntensityReading, AppError> {
            self.current().await
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn service(backend: FakeBackend) -> CarbonService {
        CarbonService::with_parts(
            AppConfig::default(),
            Arc::new(backend),
            Arc::new(DownIntensity),
        )
    }

    #[tokio::test]
    async fn refresh_warms_every_pair_with_synthetic_fallback() {
        let tmp = TempDir::new().expect("tempdir");
        let svc = service(FakeBackend::failing());
        let storage = Storage::open(&tmp.path().join("carbon.sqlite")).expect("open storage");
        let manager = svc.cache_manager(storage);

        let sources = vec!["clf".to_string(), "lab".to_string()];
        let summary = svc
            .refresh(
                &manager,
                &sources,
                &RangeKey::ALL,
                PowerSpec::default(),
                false,
                fixed_now(),
            )
            .await;
        assert_eq!(summary.refreshed.len(), 6);
        assert!(summary.failed.is_empty());

        let cached = manager
            .get_or_compute_at(
                &UsageRequest {
                    source: "lab".into(),
                    range: RangeKey::Month,
                    spec: PowerSpec::default(),
                    mode: CacheMode::CacheOnly,
                    force: false,
                },
                fixed_now(),
            )
            .await
            .expect("warmed");
        assert_eq!(cached.origin, SeriesOrigin::Synthetic);
        assert_eq!(cached.series.kwh.len(), 30);
    }

    #[tokio::test]
    async fn refresh_reports_invalid_spec_per_pair() {
        let tmp = TempDir::new().expect("tempdir");
        let svc = service(FakeBackend::failing());
        let storage = Storage::open(&tmp.path().join("carbon.sqlite")).expect("open storage");
        let manager = svc.cache_manager(storage);

        let bad = PowerSpec {
            ram_w: f64::NAN,
            ..PowerSpec::default()
        };
        let summary = svc
            .refresh(&manager, &["clf".to_string()], &[RangeKey::Day], bad, false, fixed_now())
            .await;
        assert!(summary.refreshed.is_empty());
        assert_eq!(summary.failed.len(), 1);
    }

    #[test]
    fn resolve_spec_applies_overrides_on_config_default() {
        let svc = service(FakeBackend::failing());
        let spec = svc
            .resolve_spec(&SpecOverrides {
                cpu_count: Some(4),
                ..SpecOverrides::default()
            })
            .expect("valid overrides");
        assert_eq!(spec.cpu_count, 4);
        assert_eq!(spec.ram_w, 20.0);

        let err = svc
            .resolve_spec(&SpecOverrides {
                other_w: Some(-1.0),
                ..SpecOverrides::default()
            })
            .expect_err("negative watts");
        assert!(matches!(err, AppError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn intensity_falls_back_to_default_when_offline() {
        let svc = service(FakeBackend::failing());
        assert_eq!(svc.intensity(None).await.g_per_kwh, 220.0);
        let slot = fixed_now() - chrono::Duration::days(1);
        assert_eq!(svc.intensity(Some(slot)).await.g_per_kwh, 220.0);
    }

    #[tokio::test]
    async fn probe_reports_backend_errors() {
        let svc = service(FakeBackend::failing());
        let err = svc.probe().await.err().expect("probe fails");
        assert!(err.is_recoverable());

        let svc = service(FakeBackend::new(|_| Ok(crate::metrics::QueryResult::Empty)));
        let report = svc.probe().await.expect("probe ok");
        assert_eq!(report.backend, "fake");
        assert_eq!(report.status_code, None);
    }
}
