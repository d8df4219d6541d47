//! Backup run orchestration: sequences destination, database, uploads,
//! export and pruning steps and collects their outcomes.

use crate::backup::{self, BackupManager, PruneOutcome, Usage};
use crate::config::BackupConfig;
use crate::safety::{looks_like_sqlite, LockError, RunLock};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Hook for exporting the live application's data through its own
/// interface, next to the file-level snapshots.
pub trait DataExporter {
    /// Short label used in the report.
    fn name(&self) -> &str;

    /// Write an export into `backup_dir` and return its path.
    fn export(&self, backup_dir: &Path, stamp: &str) -> io::Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Destination,
    Database,
    Uploads,
    Export,
    Prune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Skipped,
    /// A source that should exist is missing; reported loudly but not fatal.
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub status: StepStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started: DateTime<Local>,
    pub stamp: String,
    pub backup_dir: PathBuf,
    pub steps: Vec<StepReport>,
    pub pruned: Option<PruneOutcome>,
    pub usage: Option<Usage>,
}

impl RunReport {
    pub fn step(&self, step: Step) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// `0` when every step succeeded or was skipped, `1` when a step failed.
    pub fn exit_code(&self) -> u8 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    fn record(&mut self, step: Step, status: StepStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            StepStatus::Ok | StepStatus::Skipped => log::info!("{detail}"),
            StepStatus::NotFound => log::warn!("{detail}"),
            StepStatus::Failed => log::error!("{detail}"),
        }
        self.steps.push(StepReport { step, status, detail });
    }
}

/// Conditions that abort a run before any snapshot is taken.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("backup directory {path} is unavailable: {source}")]
    Destination { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl WorkerError {
    pub fn exit_code(&self) -> u8 {
        2
    }
}

pub struct BackupWorker {
    config: BackupConfig,
    manager: BackupManager,
    exporter: Option<Box<dyn DataExporter>>,
}

impl BackupWorker {
    pub fn new(config: BackupConfig) -> Self {
        let manager = BackupManager::new(config.backup_dir.clone(), config.retention());
        Self {
            config,
            manager,
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: Box<dyn DataExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn manager(&self) -> &BackupManager {
        &self.manager
    }

    /// Snapshot the database and uploads, prune expired snapshots and
    /// summarize the backup directory.
    pub fn run_backup(&self) -> Result<RunReport, WorkerError> {
        self.run_at(Local::now())
    }

    /// Same as [`run_backup`](Self::run_backup) with an explicit capture time.
    pub fn run_at(&self, now: DateTime<Local>) -> Result<RunReport, WorkerError> {
        let stamp = backup::timestamp(now);
        let mut report = RunReport {
            started: now,
            stamp: stamp.clone(),
            backup_dir: self.config.backup_dir.clone(),
            steps: Vec::new(),
            pruned: None,
            usage: None,
        };

        self.manager
            .ensure_backup_dir()
            .map_err(|source| WorkerError::Destination {
                path: self.config.backup_dir.clone(),
                source,
            })?;
        let _lock = RunLock::acquire(self.manager.backup_dir())?;
        report.record(
            Step::Destination,
            StepStatus::Ok,
            format!("Backup directory ready: {}", self.config.backup_dir.display()),
        );

        self.backup_database(&stamp, &mut report);
        self.backup_uploads(&stamp, &mut report);
        self.export_live_data(&stamp, &mut report);
        self.prune(now.into(), &mut report);

        match self.manager.usage() {
            Ok(usage) => report.usage = Some(usage),
            Err(e) => log::warn!("Could not summarize backup directory: {e}"),
        }
        Ok(report)
    }

    fn backup_database(&self, stamp: &str, report: &mut RunReport) {
        let source = &self.config.database_path;
        if !source.is_file() {
            report.record(
                Step::Database,
                StepStatus::NotFound,
                format!("Database not found: {}", source.display()),
            );
            return;
        }

        let warning = match looks_like_sqlite(source) {
            Ok(true) => "",
            Ok(false) => " (warning: no SQLite header)",
            Err(_) => " (warning: header unreadable)",
        };
        match self.manager.snapshot_database(source, stamp) {
            Ok(path) => {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                report.record(
                    Step::Database,
                    StepStatus::Ok,
                    format!(
                        "Database backed up: {} ({}){}",
                        file_name(&path),
                        human_size(size),
                        warning
                    ),
                );
            }
            Err(e) => report.record(
                Step::Database,
                StepStatus::Failed,
                format!("Database backup failed: {e}"),
            ),
        }
    }

    fn backup_uploads(&self, stamp: &str, report: &mut RunReport) {
        let source = &self.config.uploads_path;
        if !source.exists() {
            report.record(
                Step::Uploads,
                StepStatus::Skipped,
                format!("Uploads directory not found, skipped: {}", source.display()),
            );
            return;
        }
        let is_empty = fs::read_dir(source).map(|mut entries| entries.next().is_none());
        match is_empty {
            Ok(true) => {
                report.record(Step::Uploads, StepStatus::Skipped, "No uploads present, skipped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                report.record(
                    Step::Uploads,
                    StepStatus::Failed,
                    format!("Cannot read uploads directory {}: {e}", source.display()),
                );
                return;
            }
        }

        match self.manager.snapshot_uploads(source, stamp) {
            Ok((path, files)) => {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                report.record(
                    Step::Uploads,
                    StepStatus::Ok,
                    format!(
                        "Uploads archived: {} ({} files, {})",
                        file_name(&path),
                        files,
                        human_size(size)
                    ),
                );
            }
            Err(e) => report.record(
                Step::Uploads,
                StepStatus::Failed,
                format!("Uploads backup failed: {e}"),
            ),
        }
    }

    fn export_live_data(&self, stamp: &str, report: &mut RunReport) {
        let Some(exporter) = &self.exporter else {
            report.record(Step::Export, StepStatus::Skipped, "Live export not configured, skipped");
            return;
        };
        match exporter.export(self.manager.backup_dir(), stamp) {
            Ok(path) => report.record(
                Step::Export,
                StepStatus::Ok,
                format!("{} export written: {}", exporter.name(), file_name(&path)),
            ),
            Err(e) => report.record(
                Step::Export,
                StepStatus::Failed,
                format!("{} export failed: {e}", exporter.name()),
            ),
        }
    }

    fn prune(&self, now: SystemTime, report: &mut RunReport) {
        let days = self.config.retention_days;
        match self.manager.prune_expired(now) {
            Ok(outcome) if outcome.failed.is_empty() => {
                report.record(
                    Step::Prune,
                    StepStatus::Ok,
                    format!(
                        "Removed {} snapshot(s) older than {days} days",
                        outcome.removed.len()
                    ),
                );
                report.pruned = Some(outcome);
            }
            Ok(outcome) => {
                let names: Vec<&str> = outcome.failed.iter().map(|f| f.name.as_str()).collect();
                report.record(
                    Step::Prune,
                    StepStatus::Failed,
                    format!(
                        "Removed {} snapshot(s) older than {days} days, could not remove: {}",
                        outcome.removed.len(),
                        names.join(", ")
                    ),
                );
                report.pruned = Some(outcome);
            }
            Err(e) => report.record(
                Step::Prune,
                StepStatus::Failed,
                format!("Cannot scan backup directory: {e}"),
            ),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SnapshotKind;
    use chrono::TimeZone;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> BackupConfig {
        let app = tmp.path().join("app");
        BackupConfig {
            database_path: app.join("instance").join("bewerbungen.db"),
            uploads_path: app.join("uploads"),
            backup_dir: tmp.path().join("backups"),
            ..BackupConfig::default()
        }
    }

    fn write_db(config: &BackupConfig, content: &[u8]) {
        fs::create_dir_all(config.database_path.parent().unwrap()).unwrap();
        fs::write(&config.database_path, content).unwrap();
    }

    fn at(second: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 14, 3, 0, second).unwrap()
    }

    #[test]
    fn test_full_run_creates_both_snapshots() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0applications");
        fs::create_dir_all(&config.uploads_path).unwrap();
        fs::write(config.uploads_path.join("anschreiben.pdf"), b"%PDF").unwrap();

        let report = BackupWorker::new(config.clone()).run_at(at(0)).unwrap();

        assert_eq!(report.stamp, "20240514_030000");
        assert_eq!(report.step(Step::Database).unwrap().status, StepStatus::Ok);
        assert_eq!(report.step(Step::Uploads).unwrap().status, StepStatus::Ok);
        assert_eq!(report.step(Step::Export).unwrap().status, StepStatus::Skipped);
        assert_eq!(report.exit_code(), 0);
        let db_copy = config.backup_dir.join("db_backup_20240514_030000.db");
        assert_eq!(fs::read(db_copy).unwrap(), b"SQLite format 3\0applications");
        assert!(config.backup_dir.join("uploads_backup_20240514_030000.tar.gz").exists());
        let usage = report.usage.unwrap();
        assert_eq!((usage.database_snapshots, usage.uploads_archives), (1, 1));
    }

    #[test]
    fn test_missing_database_is_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::create_dir_all(&config.uploads_path).unwrap();
        fs::write(config.uploads_path.join("cv.pdf"), b"cv").unwrap();

        let report = BackupWorker::new(config.clone()).run_at(at(0)).unwrap();

        let db = report.step(Step::Database).unwrap();
        assert_eq!(db.status, StepStatus::NotFound);
        assert!(db.detail.contains("not found"));
        assert_eq!(report.step(Step::Uploads).unwrap().status, StepStatus::Ok);
        assert_eq!(report.usage.unwrap().database_snapshots, 0);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_empty_or_absent_uploads_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0");

        let worker = BackupWorker::new(config.clone());
        let report = worker.run_at(at(0)).unwrap();
        assert_eq!(report.step(Step::Uploads).unwrap().status, StepStatus::Skipped);

        fs::create_dir_all(&config.uploads_path).unwrap();
        let report = worker.run_at(at(1)).unwrap();
        let uploads = report.step(Step::Uploads).unwrap();
        assert_eq!(uploads.status, StepStatus::Skipped);
        assert_eq!(uploads.detail, "No uploads present, skipped");
        assert_eq!(report.usage.unwrap().uploads_archives, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_upload_symlink_does_not_fail_uploads() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0");
        fs::create_dir_all(&config.uploads_path).unwrap();
        fs::write(config.uploads_path.join("cv.pdf"), b"cv").unwrap();
        std::os::unix::fs::symlink("missing.pdf", config.uploads_path.join("old.pdf")).unwrap();

        let report = BackupWorker::new(config.clone()).run_at(at(0)).unwrap();

        let uploads = report.step(Step::Uploads).unwrap();
        assert_eq!(uploads.status, StepStatus::Ok);
        assert!(uploads.detail.contains("(1 files,"));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_runs_in_different_seconds_are_additive() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0");
        let worker = BackupWorker::new(config);

        worker.run_at(at(0)).unwrap();
        let report = worker.run_at(at(1)).unwrap();
        assert_eq!(report.usage.unwrap().database_snapshots, 2);
    }

    #[test]
    fn test_same_second_collision_fails_step_without_overwrite() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"first");
        let worker = BackupWorker::new(config.clone());
        worker.run_at(at(0)).unwrap();

        write_db(&config, b"second");
        let report = worker.run_at(at(0)).unwrap();
        assert_eq!(report.step(Step::Database).unwrap().status, StepStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        let copy = config.backup_dir.join(SnapshotKind::Database.file_name("20240514_030000"));
        assert_eq!(fs::read(copy).unwrap(), b"first");
    }

    #[test]
    fn test_non_sqlite_database_is_copied_with_warning() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"plain text");

        let report = BackupWorker::new(config).run_at(at(0)).unwrap();
        let db = report.step(Step::Database).unwrap();
        assert_eq!(db.status, StepStatus::Ok);
        assert!(db.detail.contains("no SQLite header"));
    }

    #[test]
    fn test_unavailable_destination_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").unwrap();
        config.backup_dir = blocker.join("backups");

        let err = BackupWorker::new(config).run_at(at(0)).unwrap_err();
        assert!(matches!(err, WorkerError::Destination { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_held_lock_aborts_run() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::create_dir_all(&config.backup_dir).unwrap();
        let _held = RunLock::acquire(&config.backup_dir).unwrap();

        let err = BackupWorker::new(config).run_at(at(0)).unwrap_err();
        assert!(matches!(err, WorkerError::Lock(LockError::Held { .. })));
    }

    #[test]
    fn test_source_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0data");
        let before = fs::metadata(&config.database_path).unwrap().modified().unwrap();

        BackupWorker::new(config.clone()).run_at(at(0)).unwrap();

        let after = fs::metadata(&config.database_path).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(fs::read(&config.database_path).unwrap(), b"SQLite format 3\0data");
    }

    fn refuse_removal(path: &Path) -> io::Result<()> {
        if path.to_string_lossy().contains("20240101") {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only snapshot"));
        }
        fs::remove_file(path)
    }

    #[test]
    fn test_failed_removal_marks_prune_failed_and_continues() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        write_db(&config, b"SQLite format 3\0");
        let mut worker = BackupWorker::new(config.clone());
        worker.manager = BackupManager::new(config.backup_dir.clone(), config.retention())
            .with_remover(refuse_removal);

        fs::create_dir_all(&config.backup_dir).unwrap();
        let expired = SystemTime::from(at(0)) - std::time::Duration::from_secs(60 * 86_400);
        for name in ["db_backup_20240101_030000.db", "db_backup_20240102_030000.db"] {
            let path = config.backup_dir.join(name);
            fs::write(&path, b"old").unwrap();
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(expired)
                .unwrap();
        }

        let report = worker.run_at(at(0)).unwrap();

        let prune = report.step(Step::Prune).unwrap();
        assert_eq!(prune.status, StepStatus::Failed);
        assert!(prune.detail.contains("db_backup_20240101_030000.db"));
        let pruned = report.pruned.as_ref().unwrap();
        assert_eq!(pruned.failed.len(), 1);
        assert_eq!(pruned.removed.len(), 1);
        assert!(!config.backup_dir.join("db_backup_20240102_030000.db").exists());
        assert_eq!(report.step(Step::Database).unwrap().status, StepStatus::Ok);
        assert_eq!(report.exit_code(), 1);
    }

    struct CountingExporter {
        calls: Cell<usize>,
    }

    impl DataExporter for CountingExporter {
        fn name(&self) -> &str {
            "csv"
        }

        fn export(&self, backup_dir: &Path, stamp: &str) -> io::Result<PathBuf> {
            self.calls.set(self.calls.get() + 1);
            let path = backup_dir.join(format!("export_{stamp}.csv"));
            fs::write(&path, "id;firma\n")?;
            Ok(path)
        }
    }

    #[test]
    fn test_configured_exporter_runs() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let worker = BackupWorker::new(config.clone())
            .with_exporter(Box::new(CountingExporter { calls: Cell::new(0) }));

        let report = worker.run_at(at(0)).unwrap();
        let export = report.step(Step::Export).unwrap();
        assert_eq!(export.status, StepStatus::Ok);
        assert!(export.detail.contains("export_20240514_030000.csv"));
        assert!(config.backup_dir.join("export_20240514_030000.csv").exists());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2 * 1024 * 1024), "2.0 MB");
        assert_eq!(human_size(1536), "1.5 KB");
    }
}
