use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use crate::model::Field;

/// One entry of the city registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityConfig {
    /// Stable identifier used as the city part of every measurement key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// NOAA station id, e.g. "GHCND:USW00094728".
    pub noaa_station: String,
    /// EIA balancing-authority respondent code, e.g. "NYIS".
    pub eia_region: String,
    /// EIA timezone label preferred when a day is reported in several zones.
    pub timezone: String,
}

impl CityConfig {
    pub fn new(id: &str, name: &str, noaa_station: &str, eia_region: &str, timezone: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            noaa_station: noaa_station.to_string(),
            eia_region: eia_region.to_string(),
            timezone: timezone.to_string(),
        }
    }
}

/// Per-severity penalty subtracted from the quality score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self { critical: 25.0, high: 15.0, medium: 5.0, low: 1.0 }
    }
}

/// Thresholds for every quality check. Built once per run and handed to
/// each check by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Temperatures above this (°F) are outliers.
    pub temp_max_f: f64,
    /// Temperatures below this (°F) are outliers.
    pub temp_min_f: f64,
    /// Energy values below this (MWh) are outliers.
    pub energy_min_mwh: f64,
    /// Deviation from the rolling mean, in rolling standard deviations.
    pub outlier_std_multiplier: f64,
    /// Number of preceding values (per city) in the rolling energy window.
    pub rolling_window: usize,
    /// Outlier counts at or above this escalate to High.
    pub outlier_high_count: usize,
    /// Outlier percentages at or above this escalate to High.
    pub outlier_high_pct: f64,
    /// Date-gap counts at or above this escalate to High.
    pub gap_high_count: usize,
    /// Maximum age of the newest record, in days.
    pub freshness_days: i64,
    pub missing_warning_pct: f64,
    pub missing_critical_pct: f64,
    pub duplicate_critical_pct: f64,
    /// Offending rows kept per issue.
    pub sample_limit: usize,
    /// Fields a row needs to count as complete.
    pub essential_fields: Vec<Field>,
    pub score_weights: SeverityWeights,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            temp_max_f: 130.0,
            temp_min_f: -50.0,
            energy_min_mwh: 0.0,
            outlier_std_multiplier: 3.0,
            rolling_window: 7,
            outlier_high_count: 5,
            outlier_high_pct: 20.0,
            gap_high_count: 3,
            freshness_days: 2,
            missing_warning_pct: 5.0,
            missing_critical_pct: 20.0,
            duplicate_critical_pct: 1.0,
            sample_limit: 10,
            essential_fields: Field::all().to_vec(),
            score_weights: SeverityWeights::default(),
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.temp_min_f >= self.temp_max_f {
            bail!(
                "thresholds.temp_min_f ({}) must be below thresholds.temp_max_f ({})",
                self.temp_min_f,
                self.temp_max_f
            );
        }
        if self.missing_warning_pct > self.missing_critical_pct {
            bail!("thresholds.missing_warning_pct must not exceed missing_critical_pct");
        }
        if self.outlier_std_multiplier <= 0.0 {
            bail!("thresholds.outlier_std_multiplier must be positive");
        }

        let w = &self.score_weights;
        if ![w.low, w.medium, w.high, w.critical].iter().all(|v| v.is_finite()) {
            bail!("score weights must be finite numbers (got {:?})", w);
        }
        if w.low < 0.0 || w.medium < w.low || w.high < w.medium || w.critical < w.high {
            bail!(
                "score weights must satisfy 0 <= low <= medium <= high <= critical (got {:?})",
                w
            );
        }
        Ok(())
    }
}

/// Retry and fallback tuning for source calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts against the primary source.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the computed delay (0.0 ..= 1.0).
    pub jitter_ratio: f64,
    /// Total attempts against the fallback source.
    pub fallback_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.5,
            fallback_attempts: 1,
        }
    }
}

/// Base URLs of the upstream sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub noaa_cdo: String,
    pub ghcnd_archive: String,
    pub eia_api: String,
    pub eia_bulk: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            noaa_cdo: "https://www.ncei.noaa.gov/cdo-web/api/v2/data".to_string(),
            ghcnd_archive: "https://www.ncei.noaa.gov/pub/data/ghcn/daily/all".to_string(),
            eia_api: "https://api.eia.gov/v2/electricity/rto/daily-region-data/data/".to_string(),
            eia_bulk: "https://www.eia.gov/electricity/data/browser/csv.php".to_string(),
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// output_dir = "output"
///
/// [retry]
/// max_attempts = 3
///
/// [thresholds]
/// freshness_days = 2
///
/// [[cities]]
/// id = "chicago"
/// name = "Chicago"
/// noaa_station = "GHCND:USW00094846"
/// eia_region = "PJM"
/// timezone = "Central"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub retry: RetryConfig,
    pub thresholds: ThresholdConfig,
    pub endpoints: Endpoints,
    pub cities: Vec<CityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            request_timeout_secs: 30,
            run_timeout_secs: 600,
            retry: RetryConfig::default(),
            thresholds: ThresholdConfig::default(),
            endpoints: Endpoints::default(),
            cities: default_cities(),
        }
    }
}

fn default_cities() -> Vec<CityConfig> {
    vec![
        CityConfig::new("new_york", "New York", "GHCND:USW00094728", "NYIS", "Eastern"),
        CityConfig::new("chicago", "Chicago", "GHCND:USW00094846", "PJM", "Central"),
        CityConfig::new("houston", "Houston", "GHCND:USW00012960", "ERCO", "Central"),
        CityConfig::new("phoenix", "Phoenix", "GHCND:USW00023183", "AZPS", "Arizona"),
        CityConfig::new("seattle", "Seattle", "GHCND:USW00024233", "SCL", "Pacific"),
    ]
}

impl Config {
    /// Load config from `path`, or from the platform config file when `path`
    /// is `None`. A missing platform file yields the defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_file_path()?, false),
        };

        if !path.exists() {
            if explicit {
                bail!("Config file not found: {}", path.display());
            }
            // First run: no config file, use built-in defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(contents).context("Failed to parse config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the platform config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "wxenergy", "wxenergy")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!("At least one [[cities]] entry is required");
        }

        let mut seen = HashSet::new();
        for city in &self.cities {
            if city.id.trim().is_empty() {
                bail!("City '{}' has an empty id", city.name);
            }
            if !seen.insert(city.id.as_str()) {
                bail!("Duplicate city id '{}'", city.id);
            }
        }

        if self.retry.max_attempts == 0 || self.retry.fallback_attempts == 0 {
            bail!("retry.max_attempts and retry.fallback_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            bail!("retry.jitter_ratio must be within 0.0..=1.0");
        }

        self.thresholds.validate()
    }

    pub fn city(&self, id: &str) -> Option<&CityConfig> {
        self.cities.iter().find(|c| c.id == id)
    }

    /// City ids in registry order.
    pub fn city_ids(&self) -> Vec<String> {
        self.cities.iter().map(|c| c.id.clone()).collect()
    }
}

/// API credentials, read from the environment and never persisted.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub noaa_token: Option<String>,
    pub eia_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            noaa_token: std::env::var("NOAA_API_TOKEN").ok().filter(|v| !v.is_empty()),
            eia_api_key: std::env::var("EIA_API_KEY").ok().filter(|v| !v.is_empty()),
        }
    }
}
