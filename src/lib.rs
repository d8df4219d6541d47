pub mod archive;
pub mod backup;
pub mod config;
pub mod installer;
pub mod registry;
pub mod report;
pub mod safety;
pub mod worker;

use clap::Parser;
use config::BackupConfig;
use installer::Installer;
use registry::crontab::CrontabRegistry;
use report::Status;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use worker::{BackupWorker, RunReport};

const CONFIG_ENV: &str = "BEWERBUNGS_BACKUP_CONFIG";
const WORKER_BIN: &str = "backup-worker";

/// Snapshot the BewerbungsManager database and uploads, then prune old snapshots.
#[derive(Debug, Parser)]
#[command(name = "backup-worker", version)]
pub struct WorkerArgs {
    /// Configuration file (JSON)
    #[arg(long, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Print a machine-readable status instead of the console report
    #[arg(long)]
    pub json: bool,

    /// List existing snapshots and exit without backing up
    #[arg(long)]
    pub list: bool,
}

/// Register the backup worker for a daily run and perform a first backup.
#[derive(Debug, Parser)]
#[command(name = "backup-install", version)]
pub struct InstallArgs {
    /// Configuration file (JSON), forwarded to the scheduled runs
    #[arg(long, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Worker executable to schedule (default: backup-worker next to this program)
    #[arg(long)]
    pub worker: Option<PathBuf>,

    /// Remove the schedule entry instead of installing it
    #[arg(long)]
    pub uninstall: bool,

    /// Print a machine-readable status instead of the console report
    #[arg(long)]
    pub json: bool,
}

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn load_config(path: Option<&Path>, json: bool) -> Result<BackupConfig, ExitCode> {
    BackupConfig::load(path).map_err(|e| {
        log::error!("{e}");
        if json {
            println!("{}", Status::<RunReport>::fatal(&e, 2).to_json());
        } else {
            eprintln!("{}", report::render_fatal(&e));
        }
        ExitCode::from(2)
    })
}

pub fn run_worker(args: WorkerArgs) -> ExitCode {
    let config = match load_config(args.config.as_deref(), args.json) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let worker = BackupWorker::new(config);

    if args.list {
        return match worker.manager().list_snapshots() {
            Ok(snapshots) if args.json => {
                println!("{}", Status::completed(&snapshots, 0).to_json());
                ExitCode::SUCCESS
            }
            Ok(snapshots) => {
                print!("{}", report::render_snapshots(&snapshots));
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Cannot list snapshots: {e}");
                ExitCode::from(1)
            }
        };
    }

    match worker.run_backup() {
        Ok(run) => {
            let code = run.exit_code();
            if args.json {
                println!("{}", Status::completed(&run, code).to_json());
            } else {
                print!("{}", report::render_run(&run));
            }
            ExitCode::from(code)
        }
        Err(e) => {
            log::error!("{e}");
            let code = e.exit_code();
            if args.json {
                println!("{}", Status::<RunReport>::fatal(&e, code).to_json());
            } else {
                eprintln!("{}", report::render_fatal(&e));
            }
            ExitCode::from(code)
        }
    }
}

pub fn run_installer(args: InstallArgs) -> ExitCode {
    let config = match load_config(args.config.as_deref(), args.json) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let worker_path = match args.worker.clone().or_else(default_worker_path) {
        Some(path) => path,
        None => {
            eprintln!("{}", report::render_fatal(&"cannot locate the backup-worker executable"));
            return ExitCode::from(1);
        }
    };

    let mut installer = Installer::new(config, CrontabRegistry::new());
    if let Some(config_file) = args.config.clone() {
        installer = installer.with_config_file(config_file);
    }

    if args.uninstall {
        return match installer.remove_schedule(&worker_path) {
            Ok(removed) => {
                println!("Removed {removed} schedule entr(ies) for {}", worker_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("{e}");
                eprintln!("{}", report::render_fatal(&e));
                ExitCode::from(1)
            }
        };
    }

    match installer.install_schedule(&worker_path) {
        Ok(install) => {
            let code = install.exit_code();
            if args.json {
                println!("{}", Status::completed(&install, code).to_json());
            } else {
                print!("{}", report::render_install(&install));
            }
            ExitCode::from(code)
        }
        Err(e) => {
            log::error!("{e}");
            if args.json {
                println!("{}", Status::<RunReport>::fatal(&e, 1).to_json());
            } else {
                eprintln!("{}", report::render_fatal(&e));
            }
            ExitCode::from(1)
        }
    }
}

fn default_worker_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.with_file_name(format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX)))
}
