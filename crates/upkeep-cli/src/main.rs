mod dispatch;
mod render;
mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use upkeep_core::UpdateError;

use crate::dispatch::{resolve_verbose, run_cli};
use crate::render::{current_output_style, format_error_lines};

#[derive(Parser, Debug)]
#[command(name = "upkeep")]
#[command(about = "Self-update orchestrator for PHP/Symfony panels", long_about = None)]
struct Cli {
    /// Panel installation root. Defaults to the current directory.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    /// Config file. Defaults to upkeep.toml in the project root.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Print machine-readable JSON instead of status lines.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull, install, migrate and fix up the panel, rolling back on failure.
    Update(UpdateArgs),
    /// Run the pre-flight environment checks.
    Check,
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Roll back to the state saved by the last update.
    Rollback {
        #[arg(long)]
        yes: bool,
    },
    Version,
}

#[derive(Args, Debug, Default, Clone)]
struct UpdateArgs {
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    skip_backup: bool,
    /// Pass --ignore-platform-reqs to the dependency install.
    #[arg(long)]
    force_platform: bool,
    #[arg(long, value_name = "DAYS")]
    backup_retention_days: Option<u32>,
    /// Per-subprocess timeout in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    Show,
    /// Compare the saved snapshot with the current state.
    Diff,
    Clear,
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    Create {
        #[arg(long, value_name = "DAYS")]
        retention_days: Option<u32>,
    },
    List,
    Restore {
        path: PathBuf,
        #[arg(long)]
        yes: bool,
    },
    Validate {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum LockCommands {
    Status,
    Release {
        /// Remove the lock even if another process holds it.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(resolve_verbose(&cli));

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in format_error_lines(&err, current_output_style()) {
                eprintln!("{line}");
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,upkeep=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,upkeep=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<UpdateError>()
        .map(UpdateError::exit_code)
        .unwrap_or(1);
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests;
