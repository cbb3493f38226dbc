use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the trendd daemon.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Statistics engine configuration.
    #[serde(default)]
    pub statistic: StatisticConfig,

    /// Snapshot persistence configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Ingest/query HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Statistics engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatisticConfig {
    /// Aggregation tick period. Default: 5s.
    #[serde(default = "default_statistic_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Channel cap beyond the built-in default channel; new channels above it
    /// are silently dropped. -1 = unlimited. Default: 100.
    #[serde(rename = "maxChannels", default = "default_max_channels")]
    pub max_channels: i32,

    /// Per-channel trend record cap. -1 = unlimited. Default: -1.
    #[serde(rename = "maxRecords", default = "default_unlimited")]
    pub max_records: i32,

    /// Percentage of the cap evicted per batch. Default: 10.
    #[serde(rename = "evictionPercent", default = "default_eviction_percent")]
    pub eviction_percent: u32,

    /// Per-fingerprint record cap. -1 = unlimited. Default: -1.
    #[serde(rename = "maxRecordsPerFingerprint", default = "default_unlimited")]
    pub max_records_per_fp: i32,

    /// Idle time before a fingerprint is evicted to cold storage.
    /// 0 disables eviction. Default: 0.
    #[serde(rename = "fingerprintTTL", default, with = "humantime_serde")]
    pub fingerprint_ttl: Duration,

    /// Directory for cold files. Defaults to `fingerprints/` next to the
    /// snapshot file.
    #[serde(rename = "coldStorageDir", default)]
    pub cold_storage_dir: Option<PathBuf>,

    /// Retention for cold entries. 0 keeps them forever. Default: 0.
    #[serde(rename = "coldTTL", default, with = "humantime_serde")]
    pub cold_ttl: Duration,
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Main snapshot path. Default: "data/statistic.db".
    #[serde(rename = "filePath", default = "default_file_path")]
    pub file_path: PathBuf,

    /// Persistence tick period. Default: 60s.
    #[serde(
        rename = "saveInterval",
        default = "default_save_interval",
        with = "humantime_serde"
    )]
    pub save_interval: Duration,
}

/// Ingest/query HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_statistic_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_channels() -> i32 {
    100
}

fn default_unlimited() -> i32 {
    -1
}

fn default_eviction_percent() -> u32 {
    10
}

fn default_file_path() -> PathBuf {
    PathBuf::from("data/statistic.db")
}

fn default_save_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for StatisticConfig {
    fn default() -> Self {
        Self {
            interval: default_statistic_interval(),
            max_channels: default_max_channels(),
            max_records: default_unlimited(),
            eviction_percent: default_eviction_percent(),
            max_records_per_fp: default_unlimited(),
            fingerprint_ttl: Duration::ZERO,
            cold_storage_dir: None,
            cold_ttl: Duration::ZERO,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            file_path: default_file_path(),
            save_interval: default_save_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.statistic.interval.is_zero() {
            bail!("statistic.interval must be positive");
        }

        if self.statistic.eviction_percent > 100 {
            bail!("statistic.evictionPercent must be at most 100");
        }

        if self.persistence.save_interval.is_zero() {
            bail!("persistence.saveInterval must be positive");
        }

        if self.persistence.file_path.as_os_str().is_empty() {
            bail!("persistence.filePath is required");
        }

        Ok(())
    }

    /// Directory for cold files: configured, or derived from the snapshot
    /// path.
    pub fn cold_dir(&self) -> PathBuf {
        if let Some(dir) = &self.statistic.cold_storage_dir {
            return dir.clone();
        }
        let parent = self
            .persistence
            .file_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        parent.join("fingerprints")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.statistic.interval, Duration::from_secs(5));
        assert_eq!(cfg.statistic.max_channels, 100);
        assert_eq!(cfg.statistic.max_records, -1);
        assert_eq!(cfg.statistic.eviction_percent, 10);
        assert_eq!(cfg.persistence.save_interval, Duration::from_secs(60));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_humantime_durations() {
        let yaml = r#"
statistic:
  interval: 1s
  maxChannels: 10
  maxRecords: 5000
  evictionPercent: 20
  maxRecordsPerFingerprint: 1000
  fingerprintTTL: 1h
  coldTTL: 30d
persistence:
  filePath: /var/lib/trendd/statistic.db
  saveInterval: 2m
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.statistic.interval, Duration::from_secs(1));
        assert_eq!(cfg.statistic.max_channels, 10);
        assert_eq!(cfg.statistic.max_records, 5000);
        assert_eq!(cfg.statistic.max_records_per_fp, 1000);
        assert_eq!(cfg.statistic.fingerprint_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.statistic.cold_ttl, Duration::from_secs(30 * 86400));
        assert_eq!(cfg.persistence.save_interval, Duration::from_secs(120));
        assert_eq!(
            cfg.persistence.file_path,
            PathBuf::from("/var/lib/trendd/statistic.db"),
        );
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut cfg = Config::default();
        cfg.statistic.interval = Duration::ZERO;
        assert!(cfg.validate().unwrap_err().to_string().contains("interval"));

        let mut cfg = Config::default();
        cfg.persistence.save_interval = Duration::ZERO;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("saveInterval"));
    }

    #[test]
    fn test_validate_rejects_oversized_eviction_percent() {
        let mut cfg = Config::default();
        cfg.statistic.eviction_percent = 101;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("evictionPercent"));
    }

    #[test]
    fn test_cold_dir_derived_from_snapshot_path() {
        let cfg = Config::default();
        assert_eq!(cfg.cold_dir(), PathBuf::from("data/fingerprints"));

        let mut cfg = Config::default();
        cfg.statistic.cold_storage_dir = Some(PathBuf::from("/cold"));
        assert_eq!(cfg.cold_dir(), PathBuf::from("/cold"));
    }
}
