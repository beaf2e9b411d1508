use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use stackforge_core::{Version, RUNTIME_SUBTREES};
use stackforge_installer::{
    acquire_lock, check_for_update, default_install_root, force_clear_lock, inspect_lock,
    list_backups, lock_owner_alive, prune_backups, read_last_backup_pointer, read_swap_marker,
    resolve_restore_source, rollback_installation, validate_installation, Backup, CheckReport,
    CheckStatus, InstallLayout, LockState, RestoreReport, UpdateEngine, UpdateOptions,
    UpdateOutcome,
};
use stackforge_release::{HttpReleaseSource, LocalReleaseSource, ReleaseSource};
use tracing::debug;

use crate::completion::write_completions_script;
use crate::config::UpdateConfig;
use crate::render::TerminalRenderer;
use crate::reporter::{format_plan_steps, prompt_yes_no, CliReporter};
use crate::{Cli, Commands, LockCommands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current();

    if let Commands::Completions { shell } = cli.command {
        let stdout = io::stdout();
        return write_completions_script(shell, &mut stdout.lock());
    }

    let root = match cli.root {
        Some(root) => root,
        None => default_install_root()?,
    };
    let layout = InstallLayout::new(root);
    let config = UpdateConfig::load(&layout.config_path())?;
    debug!(root = %layout.root().display(), "using installation root");

    match cli.command {
        Commands::Update {
            check,
            target,
            force,
            yes,
            dry_run,
            verbose,
        } => {
            let source = build_release_source(&config, cli.release_root.as_deref())?;
            let current = running_version()?;
            if check {
                let report = check_for_update(source.as_ref(), &current)?;
                let (status, line) = format_check_line(&report);
                renderer.print_status(status, &line);
                return Ok(());
            }

            let mut options = UpdateOptions::new(current);
            options.target = target;
            options.force = force;
            options.dry_run = dry_run;
            options.lock = config.lock_options();
            options.keep_backups = config.keep_backups;

            let mut reporter = CliReporter::new(renderer, verbose, yes);
            let outcome = {
                let mut engine = UpdateEngine::new(&layout, source.as_ref(), &mut reporter);
                engine.run(&options)
            };
            reporter.finish();

            let outcome = outcome?;
            if let UpdateOutcome::DryRun(plan) = &outcome {
                renderer.print_section("plan");
                renderer.print_lines(&format_plan_steps(plan));
            }
            for (status, line) in format_update_outcome_lines(&outcome) {
                renderer.print_status(status, &line);
            }
        }
        Commands::Rollback { backup, yes } => {
            let selected = resolve_restore_source(&layout, backup.as_deref())?;
            renderer.print_status("..", &describe_backup(&selected));
            if !yes {
                let stdin = io::stdin();
                let confirmed = prompt_yes_no(
                    &mut stdin.lock(),
                    &mut io::stderr(),
                    "Restore this backup over the current installation?",
                )?;
                if !confirmed {
                    renderer.print_status("warn", "rollback cancelled; nothing changed");
                    return Ok(());
                }
            }

            let report =
                rollback_installation(&layout, Some(&selected.dir), config.lock_options())?;
            for line in format_restore_lines(&report) {
                renderer.print_status("ok", &line);
            }
        }
        Commands::Backups { prune } => {
            if let Some(keep) = prune {
                let lock = acquire_lock(&layout, "prune-backups", config.lock_options())?;
                let removed = prune_backups(&layout, keep);
                lock.release()?;
                for dir in removed? {
                    renderer.print_status("ok", &format!("removed {}", dir.display()));
                }
            }

            let pointer = read_last_backup_pointer(&layout)?;
            let backups = list_backups(&layout)?;
            if backups.is_empty() {
                renderer.print_status("..", "no backups");
            }
            renderer.print_lines(&format_backup_lines(&backups, pointer.as_deref()));
        }
        Commands::Lock { command } => match command {
            LockCommands::Status => {
                let state = inspect_lock(&layout)?;
                let alive = state.as_ref().map(lock_owner_alive).unwrap_or(false);
                let (status, line) = format_lock_status(state.as_ref(), alive, now_unix()?);
                renderer.print_status(status, &line);
            }
            LockCommands::Clear => match force_clear_lock(&layout)? {
                Some(state) => {
                    let alive = lock_owner_alive(&state);
                    let (_, line) = format_lock_status(Some(&state), alive, now_unix()?);
                    renderer.print_status("warn", &format!("cleared {line}"));
                }
                None => renderer.print_status("ok", "no lock to clear"),
            },
        },
        Commands::Doctor => {
            run_doctor(&layout, &config, cli.release_root.as_deref(), renderer)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn build_release_source(
    config: &UpdateConfig,
    release_root: Option<&Path>,
) -> Result<Box<dyn ReleaseSource>> {
    match release_root {
        Some(root) => Ok(Box::new(LocalReleaseSource::new(root))),
        None => Ok(Box::new(HttpReleaseSource::new(config.http_source_config())?)),
    }
}

fn running_version() -> Result<Version> {
    Version::parse(env!("CARGO_PKG_VERSION")).context("embedded package version is malformed")
}

fn now_unix() -> Result<u64> {
    stackforge_installer::current_unix_timestamp()
}

fn run_doctor(
    layout: &InstallLayout,
    config: &UpdateConfig,
    release_root: Option<&Path>,
    renderer: TerminalRenderer,
) -> Result<()> {
    renderer.print_section("installation");
    renderer.print_status("..", &format!("root: {}", layout.root().display()));
    for candidate in layout.binary_candidates() {
        let state = if candidate.exists() { "present" } else { "absent" };
        renderer.print_status(
            "..",
            &format!("binary candidate: {} ({state})", candidate.display()),
        );
    }
    for name in RUNTIME_SUBTREES {
        let dir = layout.runtime_subtree_dir(name);
        let (status, state) = if dir.is_dir() {
            ("ok", "present")
        } else {
            ("warn", "absent")
        };
        renderer.print_status(status, &format!("runtime/{name}: {state}"));
    }
    match validate_installation(layout, "doctor") {
        Ok(install) => renderer.print_status(
            "ok",
            &format!("installation valid (binary {})", install.binary_path.display()),
        ),
        Err(err) => renderer.print_status("err", &err.to_string()),
    }

    renderer.print_section("state");
    let state = inspect_lock(layout)?;
    let alive = state.as_ref().map(lock_owner_alive).unwrap_or(false);
    let (status, line) = format_lock_status(state.as_ref(), alive, now_unix()?);
    renderer.print_status(status, &line);
    if let Some(backup) = read_swap_marker(layout)? {
        renderer.print_status(
            "warn",
            &format!(
                "interrupted update: {} will be restored by the next update or rollback",
                backup.display()
            ),
        );
    }
    match read_last_backup_pointer(layout)? {
        Some(dir) => renderer.print_status("ok", &format!("last backup: {}", dir.display())),
        None => renderer.print_status("..", "last backup: none"),
    }
    renderer.print_status(
        "..",
        &format!("backups kept after update: {}", config.keep_backups),
    );

    renderer.print_section("releases");
    renderer.print_status("..", &format!("config: {}", layout.config_path().display()));
    let source = match release_root {
        Some(root) => format!("local mirror {}", root.display()),
        None => config.releases_url.clone(),
    };
    renderer.print_status("..", &format!("release source: {source}"));
    Ok(())
}

pub(crate) fn format_check_line(report: &CheckReport) -> (&'static str, String) {
    match report.status {
        CheckStatus::UpToDate => (
            "ok",
            format!("stackforge {} is the latest release", report.current),
        ),
        CheckStatus::UpdateAvailable => (
            "..",
            format!(
                "update available: {} -> {} (run `stackforge update`)",
                report.current, report.latest
            ),
        ),
        CheckStatus::NewerThanLatest => (
            "warn",
            format!(
                "stackforge {} is newer than the latest published release {}",
                report.current, report.latest
            ),
        ),
    }
}

pub(crate) fn format_update_outcome_lines(outcome: &UpdateOutcome) -> Vec<(&'static str, String)> {
    match outcome {
        UpdateOutcome::UpToDate { version } => {
            vec![("ok", format!("stackforge {version} is already up to date"))]
        }
        UpdateOutcome::DowngradeRefused { current, target } => vec![(
            "warn",
            format!(
                "installed {current} is newer than {target}; pass --force to downgrade"
            ),
        )],
        UpdateOutcome::Cancelled { .. } => {
            vec![("warn", "update cancelled; nothing changed".to_string())]
        }
        UpdateOutcome::DryRun(plan) => vec![(
            "..",
            format!(
                "dry run: would update {} -> {}; nothing changed",
                plan.current, plan.target
            ),
        )],
        UpdateOutcome::Updated(summary) => {
            let mut lines = vec![
                (
                    "ok",
                    format!("updated stackforge {} -> {}", summary.previous, summary.new),
                ),
                (
                    "ok",
                    format!(
                        "previous installation saved to {} (undo with `stackforge rollback`)",
                        summary.backup_dir.display()
                    ),
                ),
            ];
            lines.extend(summary.pruned_backups.iter().map(|dir| {
                ("..", format!("pruned old backup {}", dir.display()))
            }));
            lines
        }
    }
}

pub(crate) fn format_restore_lines(report: &RestoreReport) -> Vec<String> {
    let mut lines = vec![
        format!("restored from {}", report.backup_dir.display()),
        format!("binary: {}", report.binary_path.display()),
    ];
    if !report.restored_subtrees.is_empty() {
        lines.push(format!(
            "runtime restored: {}",
            report.restored_subtrees.join(", ")
        ));
    }
    if !report.removed_subtrees.is_empty() {
        lines.push(format!(
            "runtime removed: {}",
            report.removed_subtrees.join(", ")
        ));
    }
    lines
}

fn describe_backup(backup: &Backup) -> String {
    format!(
        "backup {} (version {}) from {}",
        backup.id,
        backup.version,
        backup.dir.display()
    )
}

pub(crate) fn format_backup_lines(backups: &[Backup], pointer: Option<&Path>) -> Vec<String> {
    backups
        .iter()
        .map(|backup| {
            let marker = if pointer == Some(backup.dir.as_path()) {
                "*"
            } else {
                " "
            };
            let subtrees = if backup.subtrees.is_empty() {
                "-".to_string()
            } else {
                backup.subtrees.join(",")
            };
            format!(
                "{marker} {}  version={}  subtrees={subtrees}",
                backup.id, backup.version
            )
        })
        .collect()
}

pub(crate) fn format_lock_status(
    state: Option<&LockState>,
    owner_alive: bool,
    now_unix: u64,
) -> (&'static str, String) {
    match state {
        None => ("ok", "lock: not held".to_string()),
        Some(LockState::Held(record)) => {
            let age = record.age(now_unix).as_secs();
            let owner = if owner_alive { "running" } else { "not running" };
            (
                if owner_alive { ".." } else { "warn" },
                format!(
                    "lock: held by pid {} ({owner}) for '{}', {age}s old",
                    record.owner_pid, record.operation
                ),
            )
        }
        Some(LockState::Unreadable(raw)) => {
            ("warn", format!("lock: unreadable content '{raw}'"))
        }
    }
}
