//! Wattage model for a workspace host and the content hash of its assumptions.

use crate::models::PowerSpec;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Draw at full load: every core and accelerator at its TDP plus platform overhead.
pub fn full_watts(spec: &PowerSpec) -> f64 {
    (compute_watts(spec) + spec.ram_w + spec.other_w).max(0.0)
}

fn compute_watts(spec: &PowerSpec) -> f64 {
    f64::from(spec.cpu_count) * spec.cpu_tdp_w + f64::from(spec.gpu_count) * spec.gpu_tdp_w
}

/// Workload-proportional draw: memory and platform overhead are constant,
/// compute scales with utilisation.
pub fn instantaneous_watts(spec: &PowerSpec, utilization: f64) -> f64 {
    let u = utilization.clamp(0.0, 1.0);
    (spec.ram_w + spec.other_w + u * compute_watts(spec)).max(0.0)
}

/// CPU channel: busy cores (core-seconds per second) times watts per core.
pub fn cpu_channel_watts(spec: &PowerSpec, busy_cores: f64) -> f64 {
    busy_cores.max(0.0) * spec.cpu_tdp_w
}

/// RAM channel: fraction of memory actively used times RAM watts.
pub fn ram_channel_watts(spec: &PowerSpec, active_fraction: f64) -> f64 {
    active_fraction.clamp(0.0, 1.0) * spec.ram_w
}

/// Per-host draw used by the workspace poller, where the core count is
/// observed rather than taken from `PowerSpec::cpu_count`.
pub fn host_watts(spec: &PowerSpec, cores: u32, utilization: f64, mem_ratio: f64) -> f64 {
    cpu_channel_watts(spec, f64::from(cores) * utilization.clamp(0.0, 1.0))
        + ram_channel_watts(spec, mem_ratio)
        + spec.other_w.max(0.0)
}

pub fn kwh_for(watts: f64, seconds: f64) -> f64 {
    watts.max(0.0) / 1000.0 * seconds.max(0.0) / 3600.0
}

/// Presentation precision for stored bins: three decimal places.
pub fn round_kwh(kwh: f64) -> f64 {
    (kwh * 1000.0).round() / 1000.0
}

/// SHA-256 over the `PowerSpec` serialised with a fixed field order, as lowercase hex.
pub fn spec_hash(spec: &PowerSpec) -> String {
    let canonical = json!([
        ["cpu_count", spec.cpu_count],
        ["cpu_tdp_w", spec.cpu_tdp_w + 0.0],
        ["gpu_count", spec.gpu_count],
        ["gpu_tdp_w", spec.gpu_tdp_w + 0.0],
        ["other_w", spec.other_w + 0.0],
        ["ram_w", spec.ram_w + 0.0],
    ]);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_spec() -> PowerSpec {
        PowerSpec {
            cpu_count: 12,
            cpu_tdp_w: 12.0,
            gpu_count: 0,
            gpu_tdp_w: 250.0,
            ram_w: 20.0,
            other_w: 30.0,
        }
    }

    #[test]
    fn full_watts_sums_all_components() {
        assert!((full_watts(&reference_spec()) - 194.0).abs() < 1e-9);

        let with_gpu = PowerSpec {
            gpu_count: 2,
            ..reference_spec()
        };
        assert!((full_watts(&with_gpu) - 694.0).abs() < 1e-9);
    }

    #[test]
    fn instantaneous_watts_scales_compute_only() {
        let spec = reference_spec();
        assert!((instantaneous_watts(&spec, 0.0) - 50.0).abs() < 1e-9);
        assert!((instantaneous_watts(&spec, 0.5) - 122.0).abs() < 1e-9);
        assert!((instantaneous_watts(&spec, 1.0) - full_watts(&spec)).abs() < 1e-9);
        assert!((instantaneous_watts(&spec, 7.0) - full_watts(&spec)).abs() < 1e-9);
    }

    #[test]
    fn host_watts_matches_channel_split() {
        let spec = reference_spec();
        // 8 cores at 50% -> 4 busy cores * 12 W, half of 20 W RAM, 30 W other.
        assert!((host_watts(&spec, 8, 0.5, 0.5) - 88.0).abs() < 1e-9);
    }

    #[test]
    fn kwh_for_one_hour_at_one_kilowatt() {
        assert!((kwh_for(1000.0, 3600.0) - 1.0).abs() < 1e-12);
        assert_eq!(kwh_for(-5.0, 3600.0), 0.0);
    }

    #[test]
    fn round_kwh_keeps_three_decimals() {
        assert_eq!(round_kwh(0.13579), 0.136);
        assert_eq!(round_kwh(0.0004), 0.0);
    }

    #[test]
    fn spec_hash_is_fixed_length_and_deterministic() {
        let a = reference_spec();
        let b = PowerSpec {
            other_w: 30.0,
            ram_w: 20.0,
            gpu_tdp_w: 250.0,
            gpu_count: 0,
            cpu_tdp_w: 12.0,
            cpu_count: 12,
        };
        assert_eq!(spec_hash(&a), spec_hash(&b));
        assert_eq!(spec_hash(&a).len(), 64);
    }

    #[test]
    fn spec_hash_changes_with_any_single_field() {
        let base = reference_spec();
        let variants = [
            PowerSpec { cpu_count: 13, ..base },
            PowerSpec { cpu_tdp_w: 12.5, ..base },
            PowerSpec { gpu_count: 1, ..base },
            PowerSpec { gpu_tdp_w: 300.0, ..base },
            PowerSpec { ram_w: 21.0, ..base },
            PowerSpec { other_w: 31.0, ..base },
        ];
        let base_hash = spec_hash(&base);
        for variant in variants {
            assert_ne!(spec_hash(&variant), base_hash, "{variant:?}");
        }
    }

    #[test]
    fn spec_hash_treats_negative_zero_as_zero() {
        let a = PowerSpec { other_w: 0.0, ..reference_spec() };
        let b = PowerSpec { other_w: -0.0, ..reference_spec() };
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }
}
