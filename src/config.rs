//! Backup configuration: source paths, destination, retention and schedule.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// SQLite database of the application (copied, never modified)
    pub database_path: PathBuf,
    /// Uploads folder of the application (archived, never modified)
    pub uploads_path: PathBuf,
    /// Directory receiving all snapshots
    pub backup_dir: PathBuf,
    /// Snapshots older than this many days are pruned
    pub retention_days: u32,
    /// File the scheduler appends worker output to
    pub log_path: PathBuf,
    /// Daily run time (local time)
    pub schedule: ScheduleTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTime {
    pub hour: u8,
    pub minute: u8,
}

impl Default for ScheduleTime {
    fn default() -> Self {
        Self { hour: 3, minute: 0 }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        let app = default_app_dir();
        Self {
            database_path: app.join("instance").join("bewerbungen.db"),
            uploads_path: app.join("uploads"),
            backup_dir: default_backup_path(),
            retention_days: 30,
            log_path: PathBuf::from("/var/log/bewerbungsmanager_backup.log"),
            schedule: ScheduleTime::default(),
        }
    }
}

impl BackupConfig {
    /// Resolve the configuration: an explicit file wins, then the per-user
    /// config file if one exists, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_file() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "retention_days must be at least 1".to_string(),
            ));
        }
        if self.schedule.hour > 23 || self.schedule.minute > 59 {
            return Err(ConfigError::Invalid(format!(
                "schedule {:02}:{:02} is not a valid time of day",
                self.schedule.hour, self.schedule.minute
            )));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * SECONDS_PER_DAY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bewerbungsmanager")
}

fn default_backup_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backups")
        .join("bewerbungsmanager")
}

pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bewerbungs-backup").join(CONFIG_FILE))
}
