//! Console and JSON rendering of run and install results.

use crate::backup::{SnapshotEntry, SnapshotKind};
use crate::installer::{InstallReport, ScheduleState};
use crate::worker::{human_size, RunReport, StepStatus};
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;

/// Machine-readable envelope printed with `--json`.
#[derive(Debug, Serialize)]
pub struct Status<'a, T: Serialize> {
    pub status: &'static str,
    pub exit_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<'a, T: Serialize> Status<'a, T> {
    pub fn completed(report: &'a T, exit_code: u8) -> Self {
        Self {
            status: if exit_code == 0 { "ok" } else { "failed" },
            exit_code,
            report: Some(report),
            error: None,
        }
    }

    pub fn fatal(error: impl ToString, exit_code: u8) -> Self {
        Self {
            status: "fatal",
            exit_code,
            report: None,
            error: Some(error.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!(r#"{{"status":"fatal","error":"{e}"}}"#))
    }
}

fn status_label(status: StepStatus) -> String {
    match status {
        StepStatus::Ok => "  OK  ".green().bold().to_string(),
        StepStatus::Skipped => " SKIP ".yellow().bold().to_string(),
        StepStatus::NotFound => " MISS ".red().bold().to_string(),
        StepStatus::Failed => " FAIL ".red().bold().to_string(),
    }
}

pub fn render_run(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{}",
        format!("Backup {}", report.started.format("%Y-%m-%d %H:%M:%S"))
            .bold()
            .underline()
    );
    for step in &report.steps {
        let detail = match step.status {
            StepStatus::Failed | StepStatus::NotFound => step.detail.red().to_string(),
            _ => step.detail.clone(),
        };
        let _ = writeln!(out, "[{}] {}", status_label(step.status), detail);
    }

    let _ = writeln!(out, "\n{}", "Summary".bold());
    let _ = writeln!(out, "{}: {}", "Backup directory".bold(), report.backup_dir.display());
    match &report.usage {
        Some(usage) => {
            let _ = writeln!(out, "{}: {}", "Database snapshots".bold(), usage.database_snapshots);
            let _ = writeln!(out, "{}: {}", "Uploads archives".bold(), usage.uploads_archives);
            let _ = writeln!(out, "{}: {}", "Disk usage".bold(), human_size(usage.total_bytes));
        }
        None => {
            let _ = writeln!(out, "{}", "Disk usage unavailable".yellow());
        }
    }
    let verdict = if report.has_failures() {
        "Backup finished with errors".red().bold()
    } else {
        "Backup finished".green().bold()
    };
    let _ = writeln!(out, "\n{verdict}");
    out
}

pub fn render_install(report: &InstallReport) -> String {
    let mut out = String::new();
    match &report.schedule {
        ScheduleState::Installed(entry) => {
            let _ = writeln!(out, "{} {}", "Schedule installed:".green().bold(), entry);
        }
        ScheduleState::AlreadyInstalled(entry) => {
            let _ = writeln!(out, "{} {}", "Already installed:".yellow().bold(), entry);
        }
    }
    if let Some(run) = &report.first_run {
        out.push_str(&render_run(run));
    }
    if let Some(error) = &report.first_run_error {
        let _ = writeln!(out, "{} {}", "First backup aborted:".red().bold(), error);
    }
    out
}

pub fn render_snapshots(snapshots: &[SnapshotEntry]) -> String {
    if snapshots.is_empty() {
        return format!("{}\n", "No snapshots".yellow());
    }
    let mut out = String::new();
    for snapshot in snapshots {
        let kind = match snapshot.kind {
            SnapshotKind::Database => "db     ",
            SnapshotKind::Uploads => "uploads",
        };
        let modified: DateTime<Local> = snapshot.modified.into();
        let _ = writeln!(
            out,
            "{}  {}  {:>9}  {}",
            kind.cyan(),
            modified.format("%Y-%m-%d %H:%M"),
            human_size(snapshot.size),
            snapshot.name
        );
    }
    out
}

pub fn render_fatal(error: &dyn std::fmt::Display) -> String {
    format!("{} {}", "Backup aborted:".red().bold(), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Usage;
    use crate::worker::{Step, StepReport};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn sample() -> RunReport {
        RunReport {
            started: Local.with_ymd_and_hms(2024, 5, 14, 3, 0, 0).unwrap(),
            stamp: "20240514_030000".into(),
            backup_dir: PathBuf::from("/srv/backups"),
            steps: vec![
                StepReport {
                    step: Step::Database,
                    status: StepStatus::Ok,
                    detail: "Database backed up: db_backup_20240514_030000.db (2.0 MB)".into(),
                },
                StepReport {
                    step: Step::Uploads,
                    status: StepStatus::Skipped,
                    detail: "No uploads present, skipped".into(),
                },
            ],
            pruned: None,
            usage: Some(Usage {
                database_snapshots: 1,
                uploads_archives: 0,
                total_bytes: 2 * 1024 * 1024,
            }),
        }
    }

    #[test]
    fn test_render_run_lists_steps_and_summary() {
        colored::control::set_override(false);
        let text = render_run(&sample());
        assert!(text.contains("[  OK  ] Database backed up"));
        assert!(text.contains("[ SKIP ] No uploads present, skipped"));
        assert!(text.contains("Database snapshots: 1"));
        assert!(text.contains("Uploads archives: 0"));
        assert!(text.contains("Disk usage: 2.0 MB"));
        assert!(text.contains("Backup finished"));
    }

    #[test]
    fn test_json_status_envelope() {
        let report = sample();
        let json: serde_json::Value =
            serde_json::from_str(&Status::completed(&report, report.exit_code()).to_json()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["report"]["steps"][1]["status"], "skipped");
        assert_eq!(json["report"]["usage"]["database_snapshots"], 1);

        let fatal: serde_json::Value =
            serde_json::from_str(&Status::<RunReport>::fatal("disk full", 2).to_json()).unwrap();
        assert_eq!(fatal["status"], "fatal");
        assert_eq!(fatal["error"], "disk full");
        assert!(fatal.get("report").is_none());
    }
}
