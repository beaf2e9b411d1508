use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use stackforge_installer::{release_held_locks, UpdateError};
use tracing::warn;

mod completion;
mod config;
mod dispatch;
mod logging;
mod render;
mod reporter;

use completion::CliCompletionShell;
use render::TerminalRenderer;

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "stackforge", version)]
#[command(about = "Project scaffolding toolkit: self-update and installation management", long_about = None)]
pub(crate) struct Cli {
    /// Installation root [default: $STACKFORGE_HOME or ~/.stackforge]
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Read releases from a local mirror directory instead of the network
    #[arg(long, global = true, value_name = "DIR")]
    release_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update the installed binary and runtime to the latest (or a pinned) release
    Update {
        /// Only report whether a newer release exists
        #[arg(long, conflicts_with_all = ["dry_run", "force", "target"])]
        check: bool,
        /// Install exactly this version
        #[arg(long = "version", value_name = "VERSION")]
        target: Option<String>,
        /// Reinstall or downgrade even when not newer
        #[arg(long)]
        force: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Print the planned steps without changing anything
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Restore the binary and runtime from the most recent (or a named) backup
    Rollback {
        #[arg(long, value_name = "DIR")]
        backup: Option<PathBuf>,
        #[arg(short, long)]
        yes: bool,
    },
    /// List backups, optionally keeping only the newest N
    Backups {
        #[arg(long, value_name = "N")]
        prune: Option<usize>,
    },
    /// Inspect or clear the installation lock
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Report installation health
    Doctor,
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum LockCommands {
    Status,
    /// Remove the lock file regardless of owner
    Clear,
}

impl Cli {
    fn verbose(&self) -> bool {
        matches!(self.command, Commands::Update { verbose: true, .. })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose());
    if let Err(err) = ctrlc::set_handler(|| std::process::exit(release_locks_on_termination())) {
        warn!(error = %err, "failed to install termination handler");
    }

    let result = dispatch::run_cli(cli);
    release_held_locks();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            TerminalRenderer::current().eprint_status("err", &render_error(&err));
            ExitCode::from(exit_code_for(&err))
        }
    }
}

// Destructors never run on a signal exit.
fn release_locks_on_termination() -> i32 {
    release_held_locks();
    INTERRUPTED_EXIT_CODE
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<UpdateError>()
        .map(UpdateError::exit_code)
        .unwrap_or(1)
}

// UpdateError messages already embed their cause chain.
fn render_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<UpdateError>() {
        Some(update_error) => update_error.to_string(),
        None => format!("{err:#}"),
    }
}
