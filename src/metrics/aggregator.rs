use crate::bucketing::TimeWindow;
use crate::error::AppError;
use crate::metrics::{MetricsBackend, RangeQuery};
use crate::models::{PowerSpec, RangeKey, UsageSeries};
use crate::power::round_kwh;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Expensive per-instance join first, cheap cluster-wide approximation second.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelQueries {
    pub channel: &'static str,
    pub precise: String,
    pub coarse: String,
}

/// Rate window matched to bin width; short windows on coarse bins undersample.
pub fn smoothing_window(range: RangeKey) -> &'static str {
    match range {
        RangeKey::Day => "5m",
        RangeKey::Month => "30m",
        RangeKey::Year => "1h",
    }
}

pub fn cpu_queries(label: &str, smoothing: &str, spec: &PowerSpec) -> ChannelQueries {
    let sel = format!("cloud_project_name=\"{label}\"");
    let watts = spec.cpu_tdp_w;
    ChannelQueries {
        channel: "cpu",
        precise: format!(
            "(1 - avg by (instance) (rate(node_cpu_seconds_total{{mode=\"idle\",{sel}}}[{smoothing}]))) \
             * on (instance) count by (instance) (node_cpu_seconds_total{{mode=\"idle\",{sel}}}) * {watts}"
        ),
        coarse: format!(
            "sum(rate(node_cpu_seconds_total{{mode!=\"idle\",{sel}}}[{smoothing}])) * {watts}"
        ),
    }
}

pub fn ram_queries(label: &str, smoothing: &str, spec: &PowerSpec) -> ChannelQueries {
    let sel = format!("cloud_project_name=\"{label}\"");
    let watts = spec.ram_w;
    ChannelQueries {
        channel: "ram",
        precise: format!(
            "avg_over_time(node_memory_Active_bytes{{{sel}}}[{smoothing}]) \
             / on (instance) avg_over_time(node_memory_MemTotal_bytes{{{sel}}}[{smoothing}]) * {watts}"
        ),
        coarse: format!(
            "sum(node_memory_Active_bytes{{{sel}}}) / sum(node_memory_MemTotal_bytes{{{sel}}}) \
             * count(node_memory_MemTotal_bytes{{{sel}}}) * {watts}"
        ),
    }
}

pub struct MetricsAggregator {
    backend: Arc<dyn MetricsBackend>,
    sources: BTreeMap<String, String>,
    timeout: Duration,
}

impl MetricsAggregator {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        sources: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            sources,
            timeout,
        }
    }

    pub fn label_for(&self, source: &str) -> Result<&str, AppError> {
        self.sources
            .get(source)
            .map(String::as_str)
            .ok_or_else(|| AppError::UnknownSource(source.to_string()))
    }

    pub async fn aggregate_live(
        &self,
        source: &str,
        range: RangeKey,
        spec: &PowerSpec,
        now: DateTime<Utc>,
    ) -> Result<UsageSeries, AppError> {
        let label = self.label_for(source)?;
        let window = TimeWindow::build(range, now);
        let smoothing = smoothing_window(range);

        let cpu = self
            .channel_watts(&window, &cpu_queries(label, smoothing, spec))
            .await?;
        let ram = self
            .channel_watts(&window, &ram_queries(label, smoothing, spec))
            .await?;

        debug!(
            source,
            range = %range,
            cpu_points = cpu.len(),
            ram_points = ram.len(),
            "live channels fetched"
        );
        Ok(bin_energy(&window, &cpu, &ram))
    }

    async fn channel_watts(
        &self,
        window: &TimeWindow,
        queries: &ChannelQueries,
    ) -> Result<BTreeMap<i64, f64>, AppError> {
        match self.run(window, &queries.precise).await {
            Ok(points) => Ok(points),
            Err(err) => {
                warn!(
                    channel = queries.channel,
                    backend = self.backend.name(),
                    error = %err,
                    "precise query failed, retrying with coarse approximation"
                );
                self.run(window, &queries.coarse).await
            }
        }
    }

    async fn run(&self, window: &TimeWindow, expr: &str) -> Result<BTreeMap<i64, f64>, AppError> {
        let query = RangeQuery {
            expr: expr.to_string(),
            start: window.start,
            end: window.end,
            step_seconds: window.step_seconds,
        };
        let result = tokio::time::timeout(self.timeout, self.backend.range_query(&query))
            .await
            .map_err(|_| {
                AppError::UpstreamUnavailable(format!(
                    "range query timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        result.flatten()
    }
}

/// Integrates per-timestamp watts into kWh per bin. Sample order does not
/// matter; each sample stands for the step that follows it, so the closing
/// sample at `window.end` is dropped.
pub fn bin_energy(
    window: &TimeWindow,
    cpu: &BTreeMap<i64, f64>,
    ram: &BTreeMap<i64, f64>,
) -> UsageSeries {
    let mut bins = vec![0.0; window.bin_count()];
    let hours_per_sample = f64::from(window.step_seconds) / 3600.0;
    let end = window.end.timestamp();
    let timestamps: BTreeSet<i64> = cpu
        .keys()
        .chain(ram.keys())
        .copied()
        .filter(|ts| *ts < end)
        .collect();

    for ts in timestamps {
        let watts = cpu.get(&ts).copied().unwrap_or(0.0) + ram.get(&ts).copied().unwrap_or(0.0);
        let Some(slot) = window.bin_of(ts).and_then(|idx| bins.get_mut(idx)) else {
            continue;
        };
        *slot += watts.max(0.0) / 1000.0 * hours_per_sample;
    }

    UsageSeries {
        labels: window.bin_labels.clone(),
        kwh: bins.into_iter().map(round_kwh).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fake::FakeBackend;
    use crate::metrics::{QueryResult, Series};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn window_start() -> i64 {
        TimeWindow::build(RangeKey::Day, fixed_now()).start.timestamp()
    }

    fn sources() -> BTreeMap<String, String> {
        BTreeMap::from([("clf".to_string(), "CDAaaS".to_string())])
    }

    fn host(name: &str, samples: Vec<(i64, f64)>) -> Series {
        Series {
            labels: HashMap::from([("instance".to_string(), name.to_string())]),
            samples,
        }
    }

    fn aggregator(backend: Arc<FakeBackend>) -> MetricsAggregator {
        MetricsAggregator::new(backend, sources(), Duration::from_secs(5))
    }

    fn healthy_backend() -> FakeBackend {
        let t0 = window_start();
        FakeBackend::new(move |expr| {
            if expr.contains("node_cpu_seconds_total") {
                Ok(QueryResult::Matrix(vec![
                    host("a", vec![(t0, 100.0), (t0 + 3_600, 200.0)]),
                    host("b", vec![(t0, 50.0)]),
                ]))
            } else {
                Ok(QueryResult::Matrix(vec![host(
                    "a",
                    vec![(t0, 10.0), (t0 + 7_200, 40.0)],
                )]))
            }
        })
    }

    #[tokio::test]
    async fn sums_channels_and_integrates_per_bin() {
        let backend = Arc::new(healthy_backend());
        let series = aggregator(backend.clone())
            .aggregate_live("clf", RangeKey::Day, &PowerSpec::default(), fixed_now())
            .await
            .expect("live series");

        assert_eq!(series.labels.len(), 24);
        assert_eq!(series.kwh.len(), 24);
        assert_eq!(series.kwh[0], 0.16);
        assert_eq!(series.kwh[1], 0.2);
        assert_eq!(series.kwh[2], 0.04);
        assert!(series.kwh[3..].iter().all(|v| *v == 0.0));
        assert!((series.total_kwh() - 0.4).abs() < 1e-9);

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.contains("on (instance)")));
        assert!(calls.iter().all(|c| c.contains("cloud_project_name=\"CDAaaS\"")));
        assert!(calls.iter().all(|c| c.contains("[5m]")));
    }

    #[tokio::test]
    async fn precise_failure_retries_with_coarse_query() {
        let t0 = window_start();
        let backend = Arc::new(FakeBackend::new(move |expr| {
            if expr.contains("on (instance)") {
                return Err(AppError::UpstreamUnavailable("too many samples".into()));
            }
            Ok(QueryResult::Matrix(vec![Series {
                labels: HashMap::new(),
                samples: vec![(t0, 500.0)],
            }]))
        }));

        let series = aggregator(backend.clone())
            .aggregate_live("clf", RangeKey::Day, &PowerSpec::default(), fixed_now())
            .await
            .expect("coarse path succeeds");

        assert_eq!(series.kwh[0], 1.0);
        let calls = backend.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[1].starts_with("sum(rate(node_cpu_seconds_total{mode!=\"idle\""));
        assert!(calls[3].starts_with("sum(node_memory_Active_bytes"));
    }

    #[tokio::test]
    async fn both_tiers_failing_surfaces_upstream_error() {
        let backend = Arc::new(FakeBackend::failing());
        let err = aggregator(backend)
            .aggregate_live("clf", RangeKey::Month, &PowerSpec::default(), fixed_now())
            .await
            .expect_err("no data");
        assert!(err.is_recoverable());
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_after_coarse_retry() {
        let backend = Arc::new(FakeBackend::new(|_| Ok(QueryResult::Malformed("junk".into()))));
        let err = aggregator(backend)
            .aggregate_live("clf", RangeKey::Day, &PowerSpec::default(), fixed_now())
            .await
            .expect_err("malformed");
        assert!(matches!(err, AppError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unknown_source_is_rejected_before_querying() {
        let backend = Arc::new(healthy_backend());
        let err = aggregator(backend.clone())
            .aggregate_live("lab", RangeKey::Day, &PowerSpec::default(), fixed_now())
            .await
            .expect_err("unmapped source");
        assert!(matches!(err, AppError::UnknownSource(ref s) if s == "lab"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_unavailable() {
        let backend = Arc::new(healthy_backend().with_delay(Duration::from_secs(30)));
        let agg = MetricsAggregator::new(backend, sources(), Duration::from_millis(20));
        let err = agg
            .aggregate_live("clf", RangeKey::Day, &PowerSpec::default(), fixed_now())
            .await
            .expect_err("timeout");
        assert!(matches!(err, AppError::UpstreamUnavailable(ref m) if m.contains("timed out")));
    }

    #[test]
    fn smoothing_window_tracks_bin_width() {
        assert_eq!(smoothing_window(RangeKey::Day), "5m");
        assert_eq!(smoothing_window(RangeKey::Month), "30m");
        assert_eq!(smoothing_window(RangeKey::Year), "1h");
    }

    #[test]
    fn bin_energy_is_order_independent_and_keeps_labels() {
        let window = TimeWindow::build(RangeKey::Month, fixed_now());
        let t0 = window.start.timestamp();
        let cpu = BTreeMap::from([(t0 + 86_400 * 3, 1000.0), (t0, 500.0)]);
        let ram = BTreeMap::from([(t0 + 86_400 * 3, 250.0)]);

        let series = bin_energy(&window, &cpu, &ram);
        assert_eq!(series.labels, window.bin_labels);
        assert_eq!(series.kwh[0], 12.0);
        assert_eq!(series.kwh[3], 30.0);
    }

    #[test]
    fn inclusive_sample_grid_does_not_overfill_last_bin() {
        let window = TimeWindow::build(RangeKey::Day, fixed_now());
        let (start, end) = (window.start.timestamp(), window.end.timestamp());
        let cpu: BTreeMap<i64, f64> = (start..=end).step_by(3_600).map(|ts| (ts, 1000.0)).collect();
        assert_eq!(cpu.len(), 25);

        let series = bin_energy(&window, &cpu, &BTreeMap::new());
        assert_eq!(series.kwh[22], 1.0);
        assert_eq!(series.kwh[23], 1.0);
        assert!((series.total_kwh() - 24.0).abs() < 1e-9);
    }

    #[test]
    fn queries_embed_spec_wattage() {
        let spec = PowerSpec {
            cpu_tdp_w: 15.0,
            ram_w: 25.5,
            ..PowerSpec::default()
        };
        let cpu = cpu_queries("IDAaaS", "30m", &spec);
        let ram = ram_queries("IDAaaS", "30m", &spec);
        assert!(cpu.precise.ends_with("* 15"));
        assert!(cpu.coarse.ends_with("* 15"));
        assert!(ram.precise.ends_with("* 25.5"));
        assert!(ram.coarse.contains("count(node_memory_MemTotal_bytes"));
    }
}
