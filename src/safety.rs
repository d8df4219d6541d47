//! Safety guard: run lock against overlapping invocations and a sanity
//! check of the source database.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use sysinfo::{Pid, ProcessesToUpdate, System};

pub const LOCK_FILE: &str = ".backup.lock";

/// Process names a lock without a recorded start time may belong to.
const OWNER_NAMES: &[&str] = &["backup-worker", "backup-install"];

/// Exclusive lock held for the duration of a backup run.
/// The lock file is removed when the guard is dropped.
///
/// The file holds the owner's pid and, on a second line, the owner's start
/// time in seconds since the epoch. A lock is only honoured while that exact
/// process is still running, so a recycled pid does not block later runs.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock in `dir`. A lock left behind by a process that is
    /// no longer running is taken over.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE);
        match Self::create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(LockError::Io(e)),
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            // released between our attempt and the read
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(LockError::Io(e)),
        };
        let owner = LockOwner::parse(&content);
        if let Some(owner) = &owner {
            if owner.is_running(lock_mtime(&path)) {
                return Err(LockError::Held { pid: owner.pid });
            }
        }
        log::warn!(
            "Taking over stale lock {} (owner {:?} is not running)",
            path.display(),
            owner.map(|o| o.pid)
        );
        Self::take_over(&path, &content)
    }

    /// Move the stale lock aside and create a fresh one. The lock is only
    /// discarded if it still holds `judged`, the content found to be stale.
    fn take_over(path: &Path, judged: &str) -> Result<Self, LockError> {
        let aside = path.with_file_name(format!("{LOCK_FILE}.stale.{}", std::process::id()));
        match fs::rename(path, &aside) {
            Ok(()) => {
                let moved = fs::read_to_string(&aside).unwrap_or_default();
                if moved != judged {
                    // replaced by a live run in the meantime; put it back
                    let restored = fs::hard_link(&aside, path);
                    let _ = fs::remove_file(&aside);
                    restored?;
                    return Err(held_by(path));
                }
                fs::remove_file(&aside)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Io(e)),
        }
        Self::create(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => held_by(path),
            _ => LockError::Io(e),
        })
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let pid = std::process::id();
        match process_start_time(pid) {
            Some(started) => writeln!(file, "{pid}\n{started}")?,
            None => writeln!(file, "{pid}")?,
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Could not release lock {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another backup run is in progress (pid {pid})")]
    Held { pid: u32 },
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockOwner {
    pid: u32,
    started: Option<u64>,
}

impl LockOwner {
    fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines().map(str::trim);
        let pid = lines.next()?.parse().ok()?;
        let started = lines.next().and_then(|line| line.parse().ok());
        Some(Self { pid, started })
    }

    /// Whether the process that wrote the lock is still running. Without a
    /// recorded start time the process must carry a worker name and predate
    /// the lock file.
    fn is_running(&self, lock_mtime: Option<u64>) -> bool {
        let pid = Pid::from_u32(self.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = system.process(pid) else {
            return false;
        };
        match self.started {
            Some(started) => process.start_time().abs_diff(started) <= 1,
            None => {
                let name = process.name().to_string_lossy();
                let predates = lock_mtime.map_or(true, |mtime| process.start_time() <= mtime + 1);
                OWNER_NAMES.iter().any(|owner| name == *owner) && predates
            }
        }
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.start_time())
}

fn lock_mtime(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

fn held_by(path: &Path) -> LockError {
    let pid = fs::read_to_string(path)
        .ok()
        .and_then(|content| LockOwner::parse(&content))
        .map_or(0, |owner| owner.pid);
    LockError::Held { pid }
}

/// Validate that a file looks like a valid SQLite database.
/// Checks the SQLite magic header bytes.
pub fn validate_sqlite_header(data: &[u8]) -> bool {
    const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
    data.len() >= SQLITE_MAGIC.len() && data[..SQLITE_MAGIC.len()] == *SQLITE_MAGIC
}

/// Read the first bytes of `path` and check them against the SQLite header.
pub fn looks_like_sqlite(path: &Path) -> io::Result<bool> {
    let mut header = Vec::with_capacity(16);
    File::open(path)?.take(16).read_to_end(&mut header)?;
    Ok(validate_sqlite_header(&header))
}
