use bewerbungs_backup_lib::{init_logging, run_installer, InstallArgs};
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    init_logging();
    run_installer(InstallArgs::parse())
}
