use anyhow::{Context, Result};
use stackforge_release::FetchedRelease;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::fs_utils::{replace_file_atomically, swap_dir_into_place};
use crate::layout::InstallLayout;

pub(crate) const SWAP_STAGED_SUFFIX: &str = ".new";
pub(crate) const SWAP_RETIRED_SUFFIX: &str = ".old";

pub(crate) trait InstallHooks {
    fn after_binary_replaced(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_subtree_replaced(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct NoHooks;

impl InstallHooks for NoHooks {}

#[derive(Debug)]
pub(crate) struct InstallFailure {
    pub step: String,
    pub source: anyhow::Error,
}

pub(crate) fn install_release(
    layout: &InstallLayout,
    live_binary: &Path,
    release: &FetchedRelease,
    hooks: &mut dyn InstallHooks,
) -> std::result::Result<(), InstallFailure> {
    let fail = |step: String| move |source: anyhow::Error| InstallFailure { step, source };

    replace_file_atomically(&release.binary_path, live_binary, true)
        .and_then(|()| hooks.after_binary_replaced())
        .map_err(fail("binary replacement".to_string()))?;
    info!(binary = %live_binary.display(), version = %release.version, "binary replaced");

    let runtime_dir = layout.runtime_dir();
    fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("failed to create {}", runtime_dir.display()))
        .map_err(fail("runtime directory".to_string()))?;

    for name in &release.subtrees {
        swap_dir_into_place(
            &release.subtree_path(name),
            &layout.runtime_subtree_dir(name),
            SWAP_STAGED_SUFFIX,
            SWAP_RETIRED_SUFFIX,
        )
        .and_then(|()| hooks.after_subtree_replaced(name))
        .map_err(fail(format!("'{name}' subtree replacement")))?;
        debug!(subtree = name, "runtime subtree replaced");
    }

    Ok(())
}
