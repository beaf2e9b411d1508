use stackforge_core::REQUIRED_SUBTREE;
use std::path::PathBuf;
use tracing::debug;

use crate::error::UpdateError;
use crate::fs_utils::is_executable;
use crate::layout::InstallLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInstall {
    pub binary_path: PathBuf,
    pub runtime_dir: PathBuf,
}

pub fn locate_installed_binary(layout: &InstallLayout) -> Option<PathBuf> {
    layout
        .binary_candidates()
        .iter()
        .find(|candidate| is_executable(candidate))
        .cloned()
}

pub fn validate_installation(
    layout: &InstallLayout,
    operation: &str,
) -> Result<ValidatedInstall, UpdateError> {
    let invalid = |reason: String| UpdateError::InvalidInstallation {
        operation: operation.to_string(),
        reason,
    };

    let runtime_dir = layout.runtime_dir();
    if !runtime_dir.is_dir() {
        return Err(invalid(format!(
            "runtime directory {} is missing",
            runtime_dir.display()
        )));
    }

    let required = layout.runtime_subtree_dir(REQUIRED_SUBTREE);
    if !required.is_dir() {
        return Err(invalid(format!(
            "required runtime subtree {} is missing",
            required.display()
        )));
    }

    let binary_path = match locate_installed_binary(layout) {
        Some(path) => path,
        None => {
            let searched = layout
                .binary_candidates()
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let existing_but_not_executable = layout
                .binary_candidates()
                .iter()
                .find(|path| path.exists());
            return Err(invalid(match existing_but_not_executable {
                Some(path) => format!("binary at {} is not executable", path.display()),
                None => format!("no stackforge binary found (searched: {searched})"),
            }));
        }
    };

    debug!(binary = %binary_path.display(), operation, "installation validated");
    Ok(ValidatedInstall {
        binary_path,
        runtime_dir,
    })
}
