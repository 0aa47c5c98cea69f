use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const AVG_EPSILON_KWH: f64 = 1e-12;

/// One polling sample applied to a workspace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub duration_s: i64,
    pub energy_kwh: f64,
    pub ci_g_per_kwh: Option<f64>,
    pub idle: bool,
}

/// Running energy and carbon totals for one analysis workspace. All `kg`
/// values are CO2e; idle figures are a subset of the totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub source: String,
    pub hostname: String,
    pub title: String,
    pub started_at: Option<DateTime<Utc>>,
    pub runtime_seconds: u64,
    pub total_kwh: f64,
    pub idle_kwh: f64,
    pub total_kg: f64,
    pub idle_kg: f64,
    pub avg_ci_g_per_kwh: Option<f64>,
    pub last_ci_g_per_kwh: Option<f64>,
    pub last_sampled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    #[cfg(test)]
    pub fn new(id: i64, source: &str, hostname: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source: source.to_string(),
            hostname: hostname.to_string(),
            title: hostname.to_string(),
            started_at: None,
            runtime_seconds: 0,
            total_kwh: 0.0,
            idle_kwh: 0.0,
            total_kg: 0.0,
            idle_kg: 0.0,
            avg_ci_g_per_kwh: None,
            last_ci_g_per_kwh: None,
            last_sampled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn runtime_hours(&self) -> f64 {
        (self.runtime_seconds as f64 / 3600.0 * 1000.0).round() / 1000.0
    }

    /// Sets the start time once; later calls keep the first value.
    pub fn mark_started(&mut self, ts: DateTime<Utc>) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(ts);
        true
    }

    /// Folds one sample into the totals. Negative durations and energies are
    /// treated as zero so every total stays non-decreasing.
    pub fn record_usage(&mut self, sample: UsageSample, now: DateTime<Utc>) {
        let duration_s = sample.duration_s.max(0) as u64;
        let energy_kwh = if sample.energy_kwh.is_finite() {
            sample.energy_kwh.max(0.0)
        } else {
            0.0
        };

        if !sample.idle {
            self.runtime_seconds += duration_s;
        }

        let kwh_before = self.total_kwh;
        self.total_kwh += energy_kwh;
        if sample.idle {
            self.idle_kwh += energy_kwh;
        }

        if let Some(ci) = sample.ci_g_per_kwh.filter(|ci| ci.is_finite()) {
            let ci = ci.max(0.0);
            let kg = energy_kwh * ci / 1000.0;
            self.total_kg += kg;
            if sample.idle {
                self.idle_kg += kg;
            }

            self.avg_ci_g_per_kwh = Some(match self.avg_ci_g_per_kwh {
                Some(avg) if self.total_kwh > AVG_EPSILON_KWH => {
                    (kwh_before * avg + energy_kwh * ci) / self.total_kwh
                }
                Some(avg) => avg,
                None => ci,
            });
            self.last_ci_g_per_kwh = Some(ci);
        }

        self.last_sampled_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn sample(duration_s: i64, energy_kwh: f64, ci: Option<f64>, idle: bool) -> UsageSample {
        UsageSample {
            duration_s,
            energy_kwh,
            ci_g_per_kwh: ci,
            idle,
        }
    }

    fn fresh() -> Workspace {
        Workspace::new(1, "clf", "host-1", fixed_now())
    }

    #[test]
    fn busy_then_idle_sample_updates_totals_and_average() {
        let mut ws = fresh();

        ws.record_usage(sample(3_600, 1.0, Some(200.0), false), fixed_now());
        assert_eq!(ws.runtime_seconds, 3_600);
        assert!((ws.total_kwh - 1.0).abs() < 1e-12);
        assert!((ws.total_kg - 0.2).abs() < 1e-12);
        assert_eq!(ws.avg_ci_g_per_kwh, Some(200.0));

        ws.record_usage(sample(0, 1.0, Some(100.0), true), fixed_now());
        assert_eq!(ws.runtime_seconds, 3_600);
        assert!((ws.total_kwh - 2.0).abs() < 1e-12);
        assert!((ws.idle_kwh - 1.0).abs() < 1e-12);
        assert!((ws.total_kg - 0.3).abs() < 1e-12);
        assert!((ws.idle_kg - 0.1).abs() < 1e-12);
        assert!((ws.avg_ci_g_per_kwh.expect("average set") - 150.0).abs() < 1e-9);
        assert_eq!(ws.last_ci_g_per_kwh, Some(100.0));
    }

    #[test]
    fn average_is_energy_weighted_over_all_samples() {
        let samples = [(0.5, 180.0), (2.0, 90.0), (0.25, 310.0), (1.25, 140.0)];
        let mut ws = fresh();
        for (e, c) in samples {
            ws.record_usage(sample(60, e, Some(c), false), fixed_now());
        }

        let weighted: f64 = samples.iter().map(|(e, c)| e * c).sum();
        let energy: f64 = samples.iter().map(|(e, _)| e).sum();
        let avg = ws.avg_ci_g_per_kwh.expect("average set");
        assert!((avg - weighted / energy).abs() < 1e-9);
    }

    #[test]
    fn idle_samples_do_not_add_runtime() {
        let mut ws = fresh();
        ws.record_usage(sample(60, 0.01, None, true), fixed_now());
        assert_eq!(ws.runtime_seconds, 0);
        assert!((ws.idle_kwh - 0.01).abs() < 1e-12);
    }

    #[test]
    fn missing_intensity_leaves_carbon_untouched() {
        let mut ws = fresh();
        ws.record_usage(sample(60, 0.5, None, false), fixed_now());
        assert!((ws.total_kwh - 0.5).abs() < 1e-12);
        assert_eq!(ws.total_kg, 0.0);
        assert_eq!(ws.avg_ci_g_per_kwh, None);
        assert_eq!(ws.last_ci_g_per_kwh, None);
        assert_eq!(ws.last_sampled_at, Some(fixed_now()));
    }

    #[test]
    fn zero_and_negative_samples_keep_totals_non_negative() {
        let mut ws = fresh();
        ws.record_usage(sample(0, 0.0, Some(200.0), false), fixed_now());
        ws.record_usage(sample(-30, -1.0, Some(-50.0), true), fixed_now());
        ws.record_usage(sample(10, f64::NAN, Some(f64::NAN), false), fixed_now());

        assert_eq!(ws.runtime_seconds, 10);
        assert_eq!(ws.total_kwh, 0.0);
        assert_eq!(ws.idle_kwh, 0.0);
        assert_eq!(ws.total_kg, 0.0);
        assert_eq!(ws.idle_kg, 0.0);
        assert!(ws.avg_ci_g_per_kwh.expect("set on first sample") >= 0.0);
    }

    #[test]
    fn first_zero_energy_sample_takes_intensity_as_average() {
        let mut ws = fresh();
        ws.record_usage(sample(0, 0.0, Some(180.0), false), fixed_now());
        assert_eq!(ws.avg_ci_g_per_kwh, Some(180.0));

        ws.record_usage(sample(60, 1.0, Some(100.0), false), fixed_now());
        assert!((ws.avg_ci_g_per_kwh.expect("average set") - 100.0).abs() < 1e-9);
    }

    #[test]
    fn mark_started_is_set_once() {
        let mut ws = fresh();
        let first = fixed_now() - Duration::hours(5);
        assert!(ws.mark_started(first));
        assert!(!ws.mark_started(fixed_now()));
        assert_eq!(ws.started_at, Some(first));
    }

    #[test]
    fn runtime_hours_rounds_to_three_places() {
        let mut ws = fresh();
        ws.record_usage(sample(5_000, 0.0, None, false), fixed_now());
        assert_eq!(ws.runtime_hours(), 1.389);
    }
}
