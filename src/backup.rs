//! Timestamped snapshot manager with age-based retention.

use crate::archive;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Capture timestamp embedded in every snapshot name.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const DB_PREFIX: &str = "db_backup_";
const DB_SUFFIX: &str = ".db";
const UPLOADS_PREFIX: &str = "uploads_backup_";
const UPLOADS_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Database,
    Uploads,
}

impl SnapshotKind {
    pub fn file_name(self, stamp: &str) -> String {
        match self {
            SnapshotKind::Database => format!("{DB_PREFIX}{stamp}{DB_SUFFIX}"),
            SnapshotKind::Uploads => format!("{UPLOADS_PREFIX}{stamp}{UPLOADS_SUFFIX}"),
        }
    }

    /// Recognize a snapshot by name. Only names carrying a well-formed
    /// timestamp match, so unrelated files in the backup directory are
    /// never treated as snapshots.
    pub fn parse(name: &str) -> Option<(SnapshotKind, NaiveDateTime)> {
        let (kind, stamp) = if let Some(rest) = name.strip_prefix(DB_PREFIX) {
            (SnapshotKind::Database, rest.strip_suffix(DB_SUFFIX)?)
        } else if let Some(rest) = name.strip_prefix(UPLOADS_PREFIX) {
            (SnapshotKind::Uploads, rest.strip_suffix(UPLOADS_SUFFIX)?)
        } else {
            return None;
        };
        let taken = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some((kind, taken))
    }
}

pub fn timestamp(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PruneOutcome {
    pub removed: Vec<String>,
    pub kept: usize,
    pub failed: Vec<PruneFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub database_snapshots: usize,
    pub uploads_archives: usize,
    pub total_bytes: u64,
}

pub struct BackupManager {
    backup_dir: PathBuf,
    retention: Duration,
    remove: fn(&Path) -> io::Result<()>,
}

impl BackupManager {
    pub fn new(backup_dir: PathBuf, retention: Duration) -> Self {
        Self {
            backup_dir,
            retention,
            remove: remove_snapshot,
        }
    }

    /// Replace how expired snapshots are deleted.
    #[cfg(test)]
    pub(crate) fn with_remover(mut self, remove: fn(&Path) -> io::Result<()>) -> Self {
        self.remove = remove;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn ensure_backup_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.backup_dir)
    }

    /// Copy the database byte for byte into `db_backup_<stamp>.db`.
    /// An existing snapshot with the same name is never overwritten.
    pub fn snapshot_database(&self, source: &Path, stamp: &str) -> io::Result<PathBuf> {
        let target = self.backup_dir.join(SnapshotKind::Database.file_name(stamp));
        let mut input = File::open(source)?;
        let mut output = OpenOptions::new().write(true).create_new(true).open(&target)?;
        if let Err(e) = io::copy(&mut input, &mut output).and_then(|_| output.sync_all()) {
            let _ = fs::remove_file(&target);
            return Err(e);
        }
        Ok(target)
    }

    /// Archive the uploads tree into `uploads_backup_<stamp>.tar.gz`.
    /// The archive is written under a hidden name first and renamed once complete.
    pub fn snapshot_uploads(&self, source: &Path, stamp: &str) -> io::Result<(PathBuf, usize)> {
        let name = SnapshotKind::Uploads.file_name(stamp);
        let target = self.backup_dir.join(&name);
        if target.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", target.display()),
            ));
        }
        let partial = self.backup_dir.join(format!(".{name}.partial"));
        let result = File::create(&partial)
            .and_then(|file| archive::write_tar_gz(source, BufWriter::new(file)))
            .and_then(|files| fs::rename(&partial, &target).map(|_| files));
        match result {
            Ok(files) => Ok((target, files)),
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }

    /// List all snapshots, newest first. Entries that cannot be inspected
    /// are logged and left out.
    pub fn list_snapshots(&self) -> io::Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        if !self.backup_dir.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry in {}: {}", self.backup_dir.display(), e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((kind, _)) = SnapshotKind::parse(&name) else {
                continue;
            };
            match inspect(&entry) {
                Ok(Some((size, modified))) => entries.push(SnapshotEntry {
                    name,
                    path: entry.path(),
                    kind,
                    size,
                    modified,
                }),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping {}: {}", name, e),
            }
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(entries)
    }

    /// Delete every snapshot whose age at `now` exceeds the retention window.
    /// A file that cannot be removed is recorded and skipped.
    pub fn prune_expired(&self, now: SystemTime) -> io::Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();
        for snapshot in self.list_snapshots()? {
            let age = now.duration_since(snapshot.modified).unwrap_or(Duration::ZERO);
            if age <= self.retention {
                outcome.kept += 1;
                continue;
            }
            match (self.remove)(&snapshot.path) {
                Ok(()) => {
                    log::info!("Pruned {} ({} days old)", snapshot.name, age.as_secs() / 86_400);
                    outcome.removed.push(snapshot.name);
                }
                Err(e) => {
                    log::warn!("Could not remove {}: {}", snapshot.name, e);
                    outcome.failed.push(PruneFailure {
                        name: snapshot.name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Snapshot counts plus the size of everything in the backup directory.
    pub fn usage(&self) -> io::Result<Usage> {
        let mut usage = Usage::default();
        for snapshot in self.list_snapshots()? {
            match snapshot.kind {
                SnapshotKind::Database => usage.database_snapshots += 1,
                SnapshotKind::Uploads => usage.uploads_archives += 1,
            }
        }
        usage.total_bytes = dir_size(&self.backup_dir);
        Ok(usage)
    }
}

fn remove_snapshot(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// Size and modification time of a regular file, `None` for anything else.
fn inspect(entry: &fs::DirEntry) -> io::Result<Option<(u64, SystemTime)>> {
    if !entry.file_type()?.is_file() {
        return Ok(None);
    }
    let metadata = entry.metadata()?;
    Ok(Some((metadata.len(), metadata.modified()?)))
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
