use crate::cache::TtlPolicy;
use crate::error::AppError;
use crate::models::PowerSpec;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE_NAME: &str = "carbon-meter";
const TOKEN_ACCOUNT: &str = "metrics:token";
const TOKEN_ENV: &str = "CARBON_METER_METRICS_TOKEN";
const MAX_TTL_SECONDS: i64 = 10 * 365 * 86_400;

pub fn normalize_source_name(source: &str) -> String {
    source.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("CARBON_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("uk", "ukri", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".carbon-meter"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub poll_seconds: u64,
    pub metrics: MetricsSettings,
    pub intensity: IntensitySettings,
    pub ttl: TtlSettings,
    /// Dashboard source name → value of the backend's `cloud_project_name` label.
    pub sources: BTreeMap<String, String>,
    pub spec: PowerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntensitySettings {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub cache_seconds: u64,
    pub default_g_per_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlSettings {
    pub day_seconds: u64,
    pub month_seconds: u64,
    pub year_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 60,
            metrics: MetricsSettings::default(),
            intensity: IntensitySettings::default(),
            ttl: TtlSettings::default(),
            sources: BTreeMap::from([
                ("clf".to_string(), "CDAaaS".to_string()),
                ("diamond".to_string(), "DDAaaS".to_string()),
                ("isis".to_string(), "IDAaaS".to_string()),
            ]),
            spec: PowerSpec::default(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_seconds: 30,
            accept_invalid_certs: false,
        }
    }
}

impl Default for IntensitySettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.carbonintensity.org.uk".to_string(),
            timeout_seconds: 15,
            cache_seconds: 300,
            default_g_per_kwh: 220.0,
        }
    }
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            day_seconds: 3_600,
            month_seconds: 86_400,
            year_seconds: 86_400,
        }
    }
}

impl TtlSettings {
    pub fn policy(&self) -> TtlPolicy {
        let secs = |s: u64| {
            chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX).min(MAX_TTL_SECONDS))
        };
        TtlPolicy {
            day: secs(self.day_seconds),
            month: secs(self.month_seconds),
            year: secs(self.year_seconds),
        }
    }
}

impl MetricsSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("carbon.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

/// Moves a plaintext `metrics.token` into the keyring. Returns whether the
/// raw document was changed.
fn migrate_legacy_token(raw: &mut toml::Value) -> Result<bool, AppError> {
    let Some(metrics) = raw.get_mut("metrics").and_then(toml::Value::as_table_mut) else {
        return Ok(false);
    };

    let Some(token) = metrics.remove("token") else {
        return Ok(false);
    };
    if let Some(token) = token.as_str().filter(|t| !t.is_empty()) {
        set_metrics_token(token)?;
    }
    Ok(true)
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let mut sources = BTreeMap::new();
    for (source, label) in std::mem::take(&mut config.sources) {
        let normalized = normalize_source_name(&source);
        let label = label.trim().to_string();
        if normalized.is_empty() || label.is_empty() {
            changed = true;
            continue;
        }
        if normalized != source || sources.contains_key(&normalized) {
            changed = true;
        }
        sources.insert(normalized, label);
    }
    config.sources = sources;

    if let Some(url) = config.metrics.base_url.as_mut() {
        let trimmed = url.trim().trim_end_matches('/').to_string();
        if trimmed != *url {
            *url = trimmed;
            changed = true;
        }
    }
    if config.metrics.base_url.as_deref() == Some("") {
        config.metrics.base_url = None;
        changed = true;
    }

    if config.poll_seconds == 0 {
        config.poll_seconds = AppConfig::default().poll_seconds;
        changed = true;
    }

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw_str = fs::read_to_string(path)?;
    let mut raw_toml: toml::Value = toml::from_str(&raw_str)?;
    let migrated = migrate_legacy_token(&mut raw_toml)?;

    let mut parsed: AppConfig = raw_toml.try_into()?;
    parsed.spec = parsed
        .spec
        .validate()
        .map_err(|e| AppError::Config(format!("invalid [spec] in {}: {e}", path.display())))?;
    let normalized = normalize_config(&mut parsed);

    if migrated || normalized {
        save_config_to(path, &parsed)?;
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    save_config_to(&config_path()?, config)
}

fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn token_entry() -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(SERVICE_NAME, TOKEN_ACCOUNT)?)
}

pub fn set_metrics_token(token: &str) -> Result<(), AppError> {
    token_entry()?.set_password(token)?;
    Ok(())
}

/// Bearer token for the metrics backend. `None` means talk to it
/// unauthenticated; keyring failures fall through to the env var.
pub fn metrics_token() -> Option<String> {
    if let Ok(entry) = token_entry() {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    std::env::var(TOKEN_ENV).ok().filter(|v| !v.is_empty())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !cfg_path.exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}
