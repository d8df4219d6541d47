//! System crontab registry: reads and replaces the invoking user's crontab
//! through the `crontab` command.

use super::{RegistryError, RegistryResult, ScheduleRegistry};
use std::io::Write;
use std::process::{Command, Output, Stdio};

pub struct CrontabRegistry {
    program: String,
}

impl CrontabRegistry {
    pub fn new() -> Self {
        Self::with_program("crontab")
    }

    /// Use a different `crontab`-compatible executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CrontabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleRegistry for CrontabRegistry {
    fn read_table(&self) -> RegistryResult<String> {
        let output = Command::new(&self.program).arg("-l").output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_table(&stderr) {
            return Ok(String::new());
        }
        Err(command_error("read", &output))
    }

    fn write_table(&self, table: &str) -> RegistryResult<()> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(table.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(command_error("write", &output));
        }
        Ok(())
    }
}

/// `crontab -l` exits non-zero with "no crontab for <user>" when the user
/// has no table yet.
fn is_missing_table(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no crontab for")
}

fn command_error(action: &'static str, output: &Output) -> RegistryError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    RegistryError::Command {
        action,
        message: if stderr.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stderr
        },
    }
}
