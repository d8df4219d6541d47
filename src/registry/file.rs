//! File-backed registry: keeps the table in a plain file, for hosts that
//! load schedules from a drop-in directory such as `/etc/cron.d`.

use super::{RegistryResult, ScheduleRegistry};
use std::fs;
use std::io;
use std::path::PathBuf;

pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ScheduleRegistry for FileRegistry {
    fn read_table(&self) -> RegistryResult<String> {
        match fs::read_to_string(&self.path) {
            Ok(table) => Ok(table),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_table(&self, table: &str) -> RegistryResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.path.with_extension("tmp");
        fs::write(&staged, table)?;
        fs::rename(&staged, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = FileRegistry::new(tmp.path().join("crontab"));
        assert_eq!(registry.read_table().unwrap(), "");
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let registry = FileRegistry::new(tmp.path().join("cron.d").join("bewerbungen"));
        registry.write_table("0 3 * * * /opt/backup-worker\n").unwrap();
        assert_eq!(registry.read_table().unwrap(), "0 3 * * * /opt/backup-worker\n");
    }

    #[test]
    fn test_unreadable_path_is_error() {
        let tmp = TempDir::new().unwrap();
        // a directory cannot be read as a table
        let registry = FileRegistry::new(tmp.path().to_path_buf());
        assert!(registry.read_table().is_err());
    }
}
