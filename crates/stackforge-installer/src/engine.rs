use stackforge_core::{resolve_latest, Version};
use stackforge_release::{fetch_release, ReleaseSource};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backup::{
    create_backup, prune_backups, resolve_restore_source, restore_backup, Backup, RestoreReport,
    DEFAULT_KEEP_BACKUPS,
};
use crate::error::UpdateError;
use crate::fs_utils::remove_path_if_exists;
use crate::layout::InstallLayout;
use crate::lock::{acquire_lock, LockHandle, LockOptions, ReleaseOutcome};
use crate::recovery::{
    clear_swap_marker, mark_swap_started, read_swap_marker, recover_interrupted_swap,
};
use crate::state::{validate_installation, ValidatedInstall};
use crate::swap::{install_release, InstallHooks, NoHooks};
use crate::verify::verify_installed_binary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    LockAcquired,
    Validated,
    VersionsResolved,
    BackedUp,
    Fetched,
    Installed,
    Verified,
    RollingBack,
    Done,
    Failed,
}

impl UpdatePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LockAcquired => "lock-acquired",
            Self::Validated => "validated",
            Self::VersionsResolved => "versions-resolved",
            Self::BackedUp => "backed-up",
            Self::Fetched => "fetched",
            Self::Installed => "installed",
            Self::Verified => "verified",
            Self::RollingBack => "rolling-back",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait UpdateReporter {
    fn phase_reached(&mut self, _phase: UpdatePhase, _detail: &str) {}

    fn confirm(&mut self, _plan: &UpdatePlan) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn interrupted_update_restored(&mut self, _report: &RestoreReport) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl UpdateReporter for SilentReporter {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    pub current_version: Version,
    pub target: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub lock: LockOptions,
    pub keep_backups: usize,
}

impl UpdateOptions {
    pub fn new(current_version: Version) -> Self {
        Self {
            current_version,
            target: None,
            force: false,
            dry_run: false,
            lock: LockOptions::default(),
            keep_backups: DEFAULT_KEEP_BACKUPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub current: Version,
    pub target: Version,
    pub forced: bool,
    pub binary_path: PathBuf,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    pub previous: Version,
    pub new: Version,
    pub binary_path: PathBuf,
    pub backup_dir: PathBuf,
    pub pruned_backups: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: Version },
    DowngradeRefused { current: Version, target: Version },
    Cancelled { current: Version, target: Version },
    DryRun(UpdatePlan),
    Updated(UpdateSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    UpToDate,
    NewerThanLatest,
    UpdateAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub current: Version,
    pub latest: Version,
    pub status: CheckStatus,
}

pub fn check_for_update(
    source: &dyn ReleaseSource,
    current: &Version,
) -> Result<CheckReport, UpdateError> {
    let latest = resolve_target_version(source, None)?;
    let status = match current.cmp(&latest) {
        Ordering::Less => CheckStatus::UpdateAvailable,
        Ordering::Equal => CheckStatus::UpToDate,
        Ordering::Greater => CheckStatus::NewerThanLatest,
    };
    debug!(%current, %latest, ?status, "update check finished");
    Ok(CheckReport {
        current: current.clone(),
        latest,
        status,
    })
}

pub fn resolve_target_version(
    source: &dyn ReleaseSource,
    explicit: Option<&str>,
) -> Result<Version, UpdateError> {
    if let Some(raw) = explicit {
        return Ok(Version::parse(raw)?);
    }

    let tags = source.list_tags().map_err(|err| UpdateError::Fetch {
        version: "latest".to_string(),
        source: err,
    })?;
    resolve_latest(&tags).ok_or_else(|| UpdateError::NoReleasesFound {
        location: source.describe(),
    })
}

pub fn rollback_installation(
    layout: &InstallLayout,
    explicit_backup: Option<&Path>,
    lock_options: LockOptions,
) -> Result<RestoreReport, UpdateError> {
    let lock = acquire_lock(layout, "rollback", lock_options)?;
    let result = (|| -> Result<RestoreReport, UpdateError> {
        if let Some(report) = recover_interrupted_swap(layout)? {
            if explicit_backup.is_none() {
                validate_installation(layout, "rollback")?;
                return Ok(report);
            }
        }
        let backup = resolve_restore_source(layout, explicit_backup)?;
        let report =
            restore_backup(layout, &backup).map_err(|source| UpdateError::RollbackFailed {
                backup: backup.dir.clone(),
                cause: "operator-requested rollback".to_string(),
                source,
            })?;
        validate_installation(layout, "rollback")?;
        Ok(report)
    })();
    release_quietly(lock);
    result
}

pub struct UpdateEngine<'a> {
    layout: &'a InstallLayout,
    source: &'a dyn ReleaseSource,
    reporter: &'a mut dyn UpdateReporter,
    phase: UpdatePhase,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        source: &'a dyn ReleaseSource,
        reporter: &'a mut dyn UpdateReporter,
    ) -> Self {
        Self {
            layout,
            source,
            reporter,
            phase: UpdatePhase::Idle,
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn run(&mut self, options: &UpdateOptions) -> Result<UpdateOutcome, UpdateError> {
        self.run_with_hooks(options, &mut NoHooks)
    }

    pub(crate) fn run_with_hooks(
        &mut self,
        options: &UpdateOptions,
        hooks: &mut dyn InstallHooks,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.phase = UpdatePhase::Idle;
        let result = if options.dry_run {
            self.plan_only(options)
        } else {
            self.run_locked(options, hooks)
        };
        if let Err(err) = &result {
            self.enter(UpdatePhase::Failed, &err.to_string());
        }
        result
    }

    fn enter(&mut self, phase: UpdatePhase, detail: &str) {
        debug!(from = %self.phase, to = %phase, detail, "update phase");
        self.phase = phase;
        self.reporter.phase_reached(phase, detail);
    }

    fn plan_only(&mut self, options: &UpdateOptions) -> Result<UpdateOutcome, UpdateError> {
        let install = validate_installation(self.layout, "update")?;
        self.enter(UpdatePhase::Validated, &install.binary_path.display().to_string());
        let current = options.current_version.clone();
        let target = resolve_target_version(self.source, options.target.as_deref())?;
        self.enter(UpdatePhase::VersionsResolved, &format!("{current} -> {target}"));

        if let Some(outcome) = no_op_outcome(&current, &target, options.force) {
            return Ok(outcome);
        }
        Ok(UpdateOutcome::DryRun(self.build_plan(
            &install, current, target, options,
        )))
    }

    fn run_locked(
        &mut self,
        options: &UpdateOptions,
        hooks: &mut dyn InstallHooks,
    ) -> Result<UpdateOutcome, UpdateError> {
        let lock = acquire_lock(self.layout, "update", options.lock)?;
        self.enter(UpdatePhase::LockAcquired, &lock.path().display().to_string());
        let result = self.run_transaction(options, hooks);
        release_quietly(lock);
        result
    }

    fn run_transaction(
        &mut self,
        options: &UpdateOptions,
        hooks: &mut dyn InstallHooks,
    ) -> Result<UpdateOutcome, UpdateError> {
        if let Some(report) = recover_interrupted_swap(self.layout)? {
            self.reporter.interrupted_update_restored(&report);
        }

        let install = validate_installation(self.layout, "update")?;
        self.enter(UpdatePhase::Validated, &install.binary_path.display().to_string());

        let current = options.current_version.clone();
        let target = resolve_target_version(self.source, options.target.as_deref())?;
        self.enter(UpdatePhase::VersionsResolved, &format!("{current} -> {target}"));

        if let Some(outcome) = no_op_outcome(&current, &target, options.force) {
            self.enter(UpdatePhase::Done, "nothing to do");
            return Ok(outcome);
        }

        let plan = self.build_plan(&install, current.clone(), target.clone(), options);
        let confirmed = self
            .reporter
            .confirm(&plan)
            .map_err(|err| UpdateError::io("failed to read confirmation", err))?;
        if !confirmed {
            info!(%current, %target, "update cancelled by user");
            self.enter(UpdatePhase::Done, "cancelled");
            return Ok(UpdateOutcome::Cancelled { current, target });
        }

        self.layout
            .ensure_base_dirs()
            .map_err(|source| UpdateError::Backup { source })?;
        let backup = create_backup(self.layout, &install.binary_path, &current.to_string())
            .map_err(|source| UpdateError::Backup { source })?;
        self.enter(UpdatePhase::BackedUp, &backup.dir.display().to_string());

        let scratch = self.layout.make_scratch_dir("update").map_err(|err| {
            UpdateError::io("failed to prepare scratch directory", err)
        })?;
        let applied = self.apply(&install, &backup, &target, options, hooks, &scratch);
        if let Err(err) = remove_path_if_exists(&scratch) {
            warn!(path = %scratch.display(), error = %err, "failed to remove scratch directory");
        }
        applied?;

        let pruned_backups = match prune_backups(self.layout, options.keep_backups) {
            Ok(pruned) => pruned,
            Err(err) => {
                warn!(error = %err, "failed to prune old backups");
                Vec::new()
            }
        };

        info!(previous = %current, new = %target, "update complete");
        self.enter(UpdatePhase::Done, &format!("{current} -> {target}"));
        Ok(UpdateOutcome::Updated(UpdateSummary {
            previous: current,
            new: target,
            binary_path: install.binary_path,
            backup_dir: backup.dir,
            pruned_backups,
        }))
    }

    fn apply(
        &mut self,
        install: &ValidatedInstall,
        backup: &Backup,
        target: &Version,
        options: &UpdateOptions,
        hooks: &mut dyn InstallHooks,
        scratch: &Path,
    ) -> Result<(), UpdateError> {
        let fetched =
            fetch_release(self.source, target, scratch).map_err(|source| UpdateError::Fetch {
                version: target.to_string(),
                source,
            })?;
        self.enter(UpdatePhase::Fetched, &fetched.payload_root.display().to_string());

        mark_swap_started(self.layout, backup)
            .map_err(|err| UpdateError::io("refusing to replace files", err))?;
        if let Err(failure) = install_release(self.layout, &install.binary_path, &fetched, hooks) {
            let failure = UpdateError::Swap {
                step: failure.step,
                backup: backup.dir.clone(),
                source: failure.source,
            };
            return Err(self.roll_back(backup, failure));
        }
        self.enter(UpdatePhase::Installed, &install.binary_path.display().to_string());

        let pinned = options.target.as_ref().map(|_| target);
        let verified = verify_installed_binary(&install.binary_path, pinned).and_then(|report| {
            validate_installation(self.layout, "post-install verification")?;
            Ok(report)
        });
        match verified {
            Ok(report) => {
                clear_swap_marker(self.layout).map_err(|err| {
                    UpdateError::io("update verified but its in-progress marker remains", err)
                })?;
                self.enter(UpdatePhase::Verified, report.version_output.trim());
                Ok(())
            }
            Err(source) => {
                let failure = UpdateError::Verification {
                    binary: install.binary_path.clone(),
                    backup: backup.dir.clone(),
                    source,
                };
                Err(self.roll_back(backup, failure))
            }
        }
    }

    // Runs at most once per transaction; a failed restore is not retried.
    fn roll_back(&mut self, backup: &Backup, failure: UpdateError) -> UpdateError {
        warn!(backup = %backup.dir.display(), error = %failure, "restoring previous installation");
        self.enter(UpdatePhase::RollingBack, &backup.dir.display().to_string());
        match restore_backup(self.layout, backup) {
            Ok(report) => {
                info!(
                    backup = %report.backup_dir.display(),
                    subtrees = ?report.restored_subtrees,
                    "previous installation restored"
                );
                if let Err(err) = clear_swap_marker(self.layout) {
                    warn!(error = %err, "failed to remove update-in-progress marker");
                }
                failure
            }
            Err(source) => UpdateError::RollbackFailed {
                backup: backup.dir.clone(),
                cause: failure.to_string(),
                source,
            },
        }
    }

    fn build_plan(
        &self,
        install: &ValidatedInstall,
        current: Version,
        target: Version,
        options: &UpdateOptions,
    ) -> UpdatePlan {
        let binary = install.binary_path.display().to_string();
        let version_check = if options.target.is_some() {
            format!(" and require it to report {target}")
        } else {
            String::new()
        };
        let mut steps = vec![format!("acquire lock {}", self.layout.lock_path().display())];
        if let Ok(Some(interrupted)) = read_swap_marker(self.layout) {
            steps.push(format!(
                "restore {} left by an interrupted update",
                interrupted.display()
            ));
        }
        steps.extend([
            format!("validate installation (binary {binary})"),
            format!(
                "back up {binary} and runtime subtrees into {}",
                self.layout.backups_dir().display()
            ),
            format!(
                "download {} into {}",
                self.source.archive_location(&target),
                self.layout.scratch_root().display()
            ),
            "verify archive checksum when published, then unpack".to_string(),
            format!("replace binary {binary}"),
            format!(
                "replace runtime subtrees shipped by {target} under {}",
                self.layout.runtime_dir().display()
            ),
            format!("run `{binary} --version` and `--help`{version_check}"),
            format!(
                "release lock and keep the {} most recent backups",
                options.keep_backups
            ),
        ]);

        UpdatePlan {
            forced: options.force,
            binary_path: install.binary_path.clone(),
            current,
            target,
            steps,
        }
    }
}

fn no_op_outcome(current: &Version, target: &Version, force: bool) -> Option<UpdateOutcome> {
    if force {
        return None;
    }
    match current.cmp(target) {
        Ordering::Equal => {
            info!(version = %current, "already up to date");
            Some(UpdateOutcome::UpToDate {
                version: current.clone(),
            })
        }
        Ordering::Greater => {
            warn!(%current, %target, "refusing to downgrade without --force");
            Some(UpdateOutcome::DowngradeRefused {
                current: current.clone(),
                target: target.clone(),
            })
        }
        Ordering::Less => None,
    }
}

fn release_quietly(lock: LockHandle) {
    let path = lock.path().to_path_buf();
    match lock.release() {
        Ok(ReleaseOutcome::Released) | Ok(ReleaseOutcome::AlreadyGone) => {}
        Ok(ReleaseOutcome::NotOwner) => {
            warn!(path = %path.display(), "lock was taken over before release");
        }
        Err(err) => warn!(path = %path.display(), error = %err, "failed to release lock"),
    }
}
