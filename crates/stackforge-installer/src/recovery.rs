use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::backup::{load_backup, restore_backup, Backup, RestoreReport};
use crate::error::UpdateError;
use crate::fs_utils::{remove_file_if_exists, write_file_atomically};
use crate::layout::InstallLayout;

// The marker exists from just before the first live file is replaced until
// the new installation verifies or the backup it names is restored.
pub fn read_swap_marker(layout: &InstallLayout) -> Result<Option<PathBuf>> {
    let marker = layout.swap_marker_path();
    match fs::read_to_string(&marker) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(PathBuf::from(raw.trim()))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", marker.display())),
    }
}

pub(crate) fn mark_swap_started(layout: &InstallLayout, backup: &Backup) -> Result<()> {
    write_file_atomically(
        &layout.swap_marker_path(),
        &format!("{}\n", backup.dir.display()),
    )
    .context("failed to record update in progress")
}

pub(crate) fn clear_swap_marker(layout: &InstallLayout) -> Result<()> {
    let marker = layout.swap_marker_path();
    remove_file_if_exists(&marker)
        .with_context(|| format!("failed to remove {}", marker.display()))
}

// Must run under the installation lock.
pub(crate) fn recover_interrupted_swap(
    layout: &InstallLayout,
) -> Result<Option<RestoreReport>, UpdateError> {
    let marker = read_swap_marker(layout)
        .map_err(|err| UpdateError::io("failed to read update-in-progress marker", err))?;
    let Some(backup_dir) = marker else {
        return Ok(None);
    };

    warn!(backup = %backup_dir.display(), "previous update was interrupted; restoring its backup");
    let report = load_backup(&backup_dir)
        .and_then(|backup| restore_backup(layout, &backup))
        .map_err(|source| UpdateError::RollbackFailed {
            backup: backup_dir.clone(),
            cause: "an earlier update was interrupted while replacing files".to_string(),
            source,
        })?;

    if let Err(err) = clear_swap_marker(layout) {
        warn!(error = %err, "interrupted update restored but its marker could not be removed");
    }
    info!(backup = %report.backup_dir.display(), "interrupted update rolled back");
    Ok(Some(report))
}
