//! Polls instant metrics for every active host of a source and folds one
//! interval of energy into its workspace.

use crate::error::AppError;
use crate::intensity::IntensityCache;
use crate::metrics::MetricsBackend;
use crate::models::PowerSpec;
use crate::power::{host_watts, instantaneous_watts, kwh_for};
use crate::storage::Storage;
use crate::workspace::UsageSample;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instantaneous readings for one host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostReading {
    pub boot_unix: Option<f64>,
    pub cores: u32,
    pub idle_fraction: f64,
    pub mem_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalEnergy {
    pub busy_kwh: f64,
    pub idle_kwh: f64,
    pub active_seconds: i64,
}

/// Splits one poll interval of host draw into busy and idle energy.
pub fn interval_energy(spec: &PowerSpec, reading: &HostReading, poll_seconds: u64) -> IntervalEnergy {
    let idle = reading.idle_fraction.clamp(0.0, 1.0);
    let util = 1.0 - idle;
    let watts = if reading.cores == 0 {
        // No per-core series for this host; size compute from the spec instead.
        instantaneous_watts(spec, util)
    } else {
        host_watts(spec, reading.cores, util, reading.mem_ratio)
    };
    let kwh = kwh_for(watts, poll_seconds as f64);
    let idle_kwh = kwh * idle;
    IntervalEnergy {
        busy_kwh: (kwh - idle_kwh).max(0.0),
        idle_kwh,
        active_seconds: (poll_seconds as f64 * util).round() as i64,
    }
}

fn ratio(num: Option<f64>, den: Option<f64>) -> f64 {
    match (num, den) {
        (Some(n), Some(d)) if d > 0.0 => (n / d).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

pub struct WorkspaceSync {
    backend: Arc<dyn MetricsBackend>,
    intensity: Arc<IntensityCache>,
    storage: Storage,
    spec: PowerSpec,
    poll_seconds: u64,
    timeout: Duration,
}

impl WorkspaceSync {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        intensity: Arc<IntensityCache>,
        storage: Storage,
        spec: PowerSpec,
        poll_seconds: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            intensity,
            storage,
            spec,
            poll_seconds: poll_seconds.max(1),
            timeout,
        }
    }

    #[cfg(test)]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    async fn instant(&self, expr: String) -> Result<HashMap<String, f64>, AppError> {
        let result = tokio::time::timeout(self.timeout, self.backend.instant_query(&expr))
            .await
            .map_err(|_| {
                AppError::UpstreamUnavailable(format!(
                    "instant query timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        result.latest_by_label("instance")
    }

    pub async fn read_hosts(&self, label: &str) -> Result<BTreeMap<String, HostReading>, AppError> {
        let sel = format!("cloud_project_name=\"{label}\"");

        let up = self
            .instant(format!("sum by (instance) (up{{{sel}}}) == 1"))
            .await?;
        if up.is_empty() {
            return Ok(BTreeMap::new());
        }

        let boot = self
            .instant(format!("node_boot_time_seconds{{{sel}}}"))
            .await?;
        let idle_num = self
            .instant(format!(
                "sum by (instance) (rate(node_cpu_seconds_total{{mode=\"idle\",{sel}}}[1m]))"
            ))
            .await?;
        let idle_den = self
            .instant(format!(
                "sum by (instance) (rate(node_cpu_seconds_total{{{sel}}}[1m]))"
            ))
            .await?;
        let cores = self
            .instant(format!(
                "count(count by (instance, cpu) (node_cpu_seconds_total{{{sel}}})) by (instance)"
            ))
            .await?;
        let mem_active = self
            .instant(format!("node_memory_Active_bytes{{{sel}}}"))
            .await?;
        let mem_total = self
            .instant(format!("node_memory_MemTotal_bytes{{{sel}}}"))
            .await?;

        Ok(up
            .into_keys()
            .map(|host| {
                let reading = HostReading {
                    boot_unix: boot.get(&host).copied().filter(|b| *b > 0.0),
                    cores: cores
                        .get(&host)
                        .map(|c| c.max(0.0).round() as u32)
                        .unwrap_or(0),
                    idle_fraction: ratio(idle_num.get(&host).copied(), idle_den.get(&host).copied()),
                    mem_ratio: ratio(mem_active.get(&host).copied(), mem_total.get(&host).copied()),
                };
                (host, reading)
            })
            .collect())
    }

    /// One polling pass for `source`. Returns the number of hosts updated.
    pub async fn sync_source(
        &mut self,
        source: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let hosts = self.read_hosts(label).await?;
        if hosts.is_empty() {
            debug!(source, "no active hosts");
            return Ok(0);
        }

        let ci = self.intensity.current_at(now).await.g_per_kwh;
        for (host, reading) in &hosts {
            let energy = interval_energy(&self.spec, reading, self.poll_seconds);
            let mut ws = self.storage.load_or_create_workspace(source, host, now)?;

            if let Some(boot) = reading
                .boot_unix
                .and_then(|b| DateTime::from_timestamp(b as i64, 0))
            {
                ws.mark_started(boot);
            }
            if energy.busy_kwh > 0.0 {
                ws.record_usage(
                    UsageSample {
                        duration_s: energy.active_seconds,
                        energy_kwh: energy.busy_kwh,
                        ci_g_per_kwh: Some(ci),
                        idle: false,
                    },
                    now,
                );
            }
            if energy.idle_kwh > 0.0 {
                ws.record_usage(
                    UsageSample {
                        duration_s: 0,
                        energy_kwh: energy.idle_kwh,
                        ci_g_per_kwh: Some(ci),
                        idle: true,
                    },
                    now,
                );
            }
            self.storage.save_workspace(&ws)?;
        }

        info!(source, hosts = hosts.len(), ci_g_per_kwh = ci, "workspaces synced");
        Ok(hosts.len())
    }

    /// Runs `sync_source` for every mapping; a failing source is logged and
    /// skipped so the others still advance.
    pub async fn sync_all(
        &mut self,
        sources: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut updated = 0;
        for (source, label) in sources {
            match self.sync_source(source, label, now).await {
                Ok(n) => updated += n,
                Err(err) => warn!(source = %source, error = %err, "workspace sync failed"),
            }
        }
        updated
    }
}
