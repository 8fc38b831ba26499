//! certroll configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::BackupPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/certroll/config.toml";

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct CertrollConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Previous revisions to keep; 0 disables backups.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            backup_dir: default_backup_dir(),
            backup_count: default_backup_count(),
        }
    }
}

impl StoreConfig {
    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            dir: self.backup_dir.clone(),
            keep: self.backup_count,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_restart_timeout")]
    pub timeout_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_restart_timeout(),
        }
    }
}

impl RestartConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_store_path() -> PathBuf { "/var/lib/certroll/config.toml".into() }
fn default_backup_dir() -> PathBuf { "/var/lib/certroll/backup".into() }
fn default_backup_count() -> usize { 30 }
fn default_restart_timeout() -> u64 { 30 }
fn default_log_level() -> String { "info".into() }

/// Resolve the configuration path: explicit flag, then `$CERTROLL_CONFIG`,
/// then the system default.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::var_os("CERTROLL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}

/// Load configuration from `path`, falling back to defaults when it is absent.
///
/// Runs before logging is set up, so the caller reports the fallback.
pub fn load_config(path: &Path) -> Result<CertrollConfig> {
    if !path.exists() {
        return Ok(CertrollConfig::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: CertrollConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    Ok(config)
}
