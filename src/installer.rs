//! Schedule installation: registers the worker for a daily run exactly once
//! and performs a first run right away.

use crate::config::BackupConfig;
use crate::registry::{self, RegistryError, ScheduleRegistry};
use crate::worker::{BackupWorker, RunReport};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "entry")]
pub enum ScheduleState {
    Installed(String),
    AlreadyInstalled(String),
}

#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub worker: PathBuf,
    pub schedule: ScheduleState,
    pub first_run: Option<RunReport>,
    /// Set when the first run aborted; the schedule stays installed.
    pub first_run_error: Option<String>,
}

impl InstallReport {
    pub fn exit_code(&self) -> u8 {
        match (&self.first_run, &self.first_run_error) {
            (_, Some(_)) => 2,
            (Some(report), None) => report.exit_code(),
            (None, None) => 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("worker {path} is not usable: {source}")]
    Worker { path: PathBuf, source: io::Error },
    #[error("path {0} contains whitespace and cannot be scheduled")]
    UnsupportedPath(PathBuf),
    #[error("schedule registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("backup directory {path} is unavailable: {source}")]
    Destination { path: PathBuf, source: io::Error },
}

pub struct Installer<R: ScheduleRegistry> {
    config: BackupConfig,
    registry: R,
    config_file: Option<PathBuf>,
}

impl<R: ScheduleRegistry> Installer<R> {
    pub fn new(config: BackupConfig, registry: R) -> Self {
        Self {
            config,
            registry,
            config_file: None,
        }
    }

    /// Pass this config file to every scheduled run.
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn install_schedule(&self, worker: &Path) -> Result<InstallReport, InstallError> {
        let worker = resolve(worker)?;
        make_executable(&worker).map_err(|source| InstallError::Worker {
            path: worker.clone(),
            source,
        })?;

        let table = self.registry.read_table()?;
        let schedule = match registry::find_entries(&table, &worker).first() {
            Some(existing) => {
                log::info!("Schedule already installed: {existing}");
                ScheduleState::AlreadyInstalled(existing.to_string())
            }
            None => {
                let entry = registry::daily_entry(
                    self.config.schedule,
                    &self.command(&worker)?,
                    &self.config.log_path,
                );
                self.registry
                    .write_table(&registry::append_entry(&table, &entry))?;
                log::info!("Schedule installed: {entry}");
                ScheduleState::Installed(entry)
            }
        };

        fs::create_dir_all(&self.config.backup_dir).map_err(|source| {
            InstallError::Destination {
                path: self.config.backup_dir.clone(),
                source,
            }
        })?;

        log::info!("Running first backup");
        let (first_run, first_run_error) =
            match BackupWorker::new(self.config.clone()).run_backup() {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    log::error!("First backup run aborted: {e}");
                    (None, Some(e.to_string()))
                }
            };

        Ok(InstallReport {
            worker,
            schedule,
            first_run,
            first_run_error,
        })
    }

    /// Remove every entry running `worker`. Returns how many were removed.
    pub fn remove_schedule(&self, worker: &Path) -> Result<usize, InstallError> {
        let worker = fs::canonicalize(worker).unwrap_or_else(|_| worker.to_path_buf());
        let table = self.registry.read_table()?;
        let (updated, removed) = registry::remove_entries(&table, &worker);
        if removed > 0 {
            self.registry.write_table(&updated)?;
            log::info!("Removed {removed} schedule entr(ies) for {}", worker.display());
        } else {
            log::info!("No schedule entry for {}", worker.display());
        }
        Ok(removed)
    }

    fn command(&self, worker: &Path) -> Result<String, InstallError> {
        let mut command = schedulable(worker)?;
        if let Some(config_file) = &self.config_file {
            let config_file = resolve(config_file)?;
            command.push_str(" --config ");
            command.push_str(&schedulable(&config_file)?);
        }
        Ok(command)
    }
}

fn resolve(path: &Path) -> Result<PathBuf, InstallError> {
    fs::canonicalize(path).map_err(|source| InstallError::Worker {
        path: path.to_path_buf(),
        source,
    })
}

fn schedulable(path: &Path) -> Result<String, InstallError> {
    let text = path.to_string_lossy();
    if text.chars().any(char::is_whitespace) {
        return Err(InstallError::UnsupportedPath(path.to_path_buf()));
    }
    Ok(text.into_owned())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> io::Result<()> {
    fs::metadata(path).map(|_| ())
}
