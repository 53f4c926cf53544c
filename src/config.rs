//! Configuration handling
//!
//! Manages the classroom-sync.toml configuration file.
//!
//! ## Environment Variables
//!
//! The following environment variables override config file settings:
//!
//! - `CLASSROOM_SYNC_DATA_DIR` - Directory holding the local database
//! - `CLASSROOM_SYNC_BASE_URL` - Progress server base URL
//! - `CLASSROOM_SYNC_PROGRESS_PATH` - Path of the submission endpoint
//! - `CLASSROOM_SYNC_PROBE_URL` - URL polled to detect connectivity
//! - `CLASSROOM_SYNC_INTERVAL_SECS` - Periodic sync interval
//! - `CLASSROOM_SYNC_REQUEST_TIMEOUT_SECS` - Per-request timeout (0 disables)
//! - `CLASSROOM_SYNC_RETENTION_DAYS` - How long synced records are kept
//!
//! These can be set in a `.env` file next to the configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retention::RetentionPolicy;
use crate::sync::WorkerConfig;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "classroom-sync.toml";

/// Environment variable names
pub const ENV_DATA_DIR: &str = "CLASSROOM_SYNC_DATA_DIR";
pub const ENV_BASE_URL: &str = "CLASSROOM_SYNC_BASE_URL";
pub const ENV_PROGRESS_PATH: &str = "CLASSROOM_SYNC_PROGRESS_PATH";
pub const ENV_PROBE_URL: &str = "CLASSROOM_SYNC_PROBE_URL";
pub const ENV_SYNC_INTERVAL: &str = "CLASSROOM_SYNC_INTERVAL_SECS";
pub const ENV_REQUEST_TIMEOUT: &str = "CLASSROOM_SYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_RETENTION_DAYS: &str = "CLASSROOM_SYNC_RETENTION_DAYS";

/// Upper bound accepted for `retention_days` (a century)
pub const MAX_RETENTION_DAYS: u64 = 36_500;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the database and the device id file
    pub data_dir: PathBuf,
    /// Progress server base URL
    pub base_url: String,
    /// Submission endpoint, relative to `base_url`
    pub progress_path: String,
    /// Connectivity probe target; without it the device is assumed online
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub debounce_ms: u64,
    /// Unset means no timeout
    pub request_timeout_secs: Option<u64>,
    pub retention_days: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            base_url: "http://localhost:3000".to_string(),
            progress_path: "/api/progress".to_string(),
            probe_url: None,
            probe_interval_secs: 15,
            sync_interval_secs: 30,
            settle_delay_secs: 2,
            debounce_ms: 1000,
            request_timeout_secs: None,
            retention_days: 7,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a directory
    ///
    /// Loads any `.env` file in the directory, then the config file if it
    /// exists (defaults otherwise), then applies environment overrides.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            tracing::debug!("No {} found, using defaults", config_path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without env handling
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var(ENV_DATA_DIR) {
            if !data_dir.is_empty() {
                self.data_dir = PathBuf::from(data_dir);
            }
        }

        if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
            if !base_url.is_empty() {
                self.base_url = base_url;
            }
        }

        if let Ok(path) = std::env::var(ENV_PROGRESS_PATH) {
            if !path.is_empty() {
                self.progress_path = path;
            }
        }

        if let Ok(url) = std::env::var(ENV_PROBE_URL) {
            self.probe_url = if url.is_empty() { None } else { Some(url) };
        }

        if let Ok(secs) = std::env::var(ENV_SYNC_INTERVAL) {
            if let Ok(secs) = secs.parse::<u64>() {
                self.sync_interval_secs = secs;
            }
        }

        // 0 turns the timeout off
        if let Ok(secs) = std::env::var(ENV_REQUEST_TIMEOUT) {
            if let Ok(secs) = secs.parse::<u64>() {
                self.request_timeout_secs = if secs == 0 { None } else { Some(secs) };
            }
        }

        if let Ok(days) = std::env::var(ENV_RETENTION_DAYS) {
            if let Ok(days) = days.parse::<u64>() {
                self.retention_days = days;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_interval_secs == 0 {
            anyhow::bail!("sync_interval_secs must be greater than zero");
        }
        if self.probe_url.is_some() && self.probe_interval_secs == 0 {
            anyhow::bail!("probe_interval_secs must be greater than zero");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("base_url must be an http(s) URL, got '{}'", self.base_url);
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            anyhow::bail!(
                "retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS,
                self.retention_days
            );
        }
        Ok(())
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(Duration::from_secs(
            self.retention_days.saturating_mul(SECS_PER_DAY),
        ))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.worker_config(), WorkerConfig::default());
        assert_eq!(config.retention_policy(), RetentionPolicy::default());
        assert!(config.request_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "base_url = \"https://school.example\"\nrequest_timeout_secs = 20\n",
        )
        .unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.base_url, "https://school.example");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(20)));
        assert_eq!(config.sync_interval_secs, 30);
    }

    #[test]
    fn test_save_and_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let config = SyncConfig {
            probe_url: Some("http://localhost:3000/health".to_string()),
            ..Default::default()
        };
        config.save(tmp.path()).unwrap();

        let loaded = SyncConfig::from_file(&tmp.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SyncConfig {
            sync_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            base_url: "ftp://nope".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_retention_is_rejected_without_overflow() {
        let config = SyncConfig {
            retention_days: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.retention_policy().max_age, Duration::from_secs(u64::MAX));

        let config = SyncConfig {
            retention_days: MAX_RETENTION_DAYS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.retention_policy().max_age,
            Duration::from_secs(MAX_RETENTION_DAYS * SECS_PER_DAY)
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "sync_interval_secs = \"soon\"").unwrap();
        assert!(SyncConfig::from_file(&path).is_err());
    }
}
