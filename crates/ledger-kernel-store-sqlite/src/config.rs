use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::staging::parent_dir;

pub const DEFAULT_DB_PATH: &str = "./ledger_kernel.sqlite3";
pub const DEFAULT_MAX_BACKUPS: usize = 5;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_READER_POOL_SIZE: usize = 4;

/// How many backups survive a prune, by count and by age.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_days: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_count: DEFAULT_MAX_BACKUPS, max_age_days: None }
    }
}

/// Store settings, loadable from YAML.
///
/// ```yaml
/// db_path: /var/lib/ledger/ledger.sqlite3
/// backup_dir: /var/lib/ledger/backups
/// retention:
///   max_count: 5
///   max_age_days: 30
/// auto_backup_interval_hours: 24
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Defaults to `<db dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    pub retention: RetentionPolicy,
    pub auto_backup_interval_hours: Option<u64>,
    pub busy_timeout_ms: u64,
    pub reader_pool_size: usize,
    pub backup_before_migration: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            backup_dir: None,
            retention: RetentionPolicy::default(),
            auto_backup_interval_hours: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            reader_pool_size: DEFAULT_READER_POOL_SIZE,
            backup_before_migration: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn for_path(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), ..Self::default() }
    }

    /// Load a YAML config file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse store config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when a setting is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.retention.max_count == 0 {
            return Err(anyhow!("retention.max_count must be at least 1"));
        }
        if self.reader_pool_size == 0 {
            return Err(anyhow!("reader_pool_size must be at least 1"));
        }
        if self.auto_backup_interval_hours == Some(0) {
            return Err(anyhow!("auto_backup_interval_hours must be at least 1 when set"));
        }
        Ok(())
    }

    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir.clone().unwrap_or_else(|| parent_dir(&self.db_path).join("backups"))
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn auto_backup_interval(&self) -> Option<Duration> {
        self.auto_backup_interval_hours.map(|hours| Duration::from_secs(hours.saturating_mul(3_600)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() -> Result<()> {
        let config = StoreConfig::from_yaml_str(
            "db_path: /tmp/ledger.sqlite3\nretention:\n  max_age_days: 30\n",
        )?;
        assert_eq!(config.db_path, PathBuf::from("/tmp/ledger.sqlite3"));
        assert_eq!(config.retention.max_count, DEFAULT_MAX_BACKUPS);
        assert_eq!(config.retention.max_age_days, Some(30));
        assert_eq!(config.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert!(config.backup_before_migration);
        assert_eq!(config.backup_dir(), PathBuf::from("/tmp/backups"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_keys_and_zero_retention() {
        assert!(StoreConfig::from_yaml_str("db_path: a.db\nretain: 3\n").is_err());
        let Err(err) = StoreConfig::from_yaml_str("retention:\n  max_count: 0\n") else {
            panic!("zero retention count should be rejected");
        };
        assert!(format!("{err:#}").contains("max_count"));
    }

    #[test]
    fn relative_db_path_puts_backups_next_to_it() {
        let config = StoreConfig::for_path("ledger.sqlite3");
        assert_eq!(config.backup_dir(), PathBuf::from("./backups"));
        assert_eq!(config.auto_backup_interval(), None);
    }
}
