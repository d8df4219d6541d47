//! Schedule registry interface and implementations.

pub mod crontab;
pub mod file;

use crate::config::ScheduleTime;
use std::path::Path;

/// The result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crontab {action} failed: {message}")]
    Command {
        action: &'static str,
        message: String,
    },
}

/// A crontab-style table of scheduled commands, one entry per line.
pub trait ScheduleRegistry {
    /// Read the whole table. A registry without any table reads as empty.
    fn read_table(&self) -> RegistryResult<String>;

    /// Replace the whole table.
    fn write_table(&self, table: &str) -> RegistryResult<()>;
}

/// Build a daily entry: `M H * * * <command> >> <log> 2>&1`.
pub fn daily_entry(at: ScheduleTime, command: &str, log_path: &Path) -> String {
    format!(
        "{} {} * * * {} >> {} 2>&1",
        at.minute,
        at.hour,
        command,
        log_path.display()
    )
}

/// Whether an active (non-comment) line runs `worker`.
pub fn references(line: &str, worker: &Path) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return false;
    }
    let worker = worker.to_string_lossy();
    line.split_whitespace().any(|token| token == worker)
}

pub fn find_entries<'a>(table: &'a str, worker: &Path) -> Vec<&'a str> {
    table.lines().filter(|line| references(line, worker)).collect()
}

/// Append `entry` to `table`, keeping exactly one trailing newline.
pub fn append_entry(table: &str, entry: &str) -> String {
    let mut updated = table.trim_end_matches('\n').to_string();
    if !updated.is_empty() {
        updated.push('\n');
    }
    updated.push_str(entry);
    updated.push('\n');
    updated
}

/// Drop every active line that runs `worker`. Returns the new table and
/// how many lines were removed.
pub fn remove_entries(table: &str, worker: &Path) -> (String, usize) {
    let mut removed = 0;
    let mut updated = String::new();
    for line in table.lines() {
        if references(line, worker) {
            removed += 1;
        } else {
            updated.push_str(line);
            updated.push('\n');
        }
    }
    (updated, removed)
}
