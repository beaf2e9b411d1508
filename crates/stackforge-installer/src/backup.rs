// A backup is assembled under `<id>.partial` and renamed into place once complete.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use stackforge_core::RUNTIME_SUBTREES;
use stackforge_release::sha256_file_hex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::fs_utils::{
    copy_tree, current_unix_timestamp, remove_path_if_exists, replace_file_atomically,
    sibling_path, swap_dir_into_place, write_file_atomically,
};
use crate::layout::InstallLayout;
use crate::swap::{SWAP_RETIRED_SUFFIX, SWAP_STAGED_SUFFIX};

pub const DEFAULT_KEEP_BACKUPS: usize = 3;

const SNAPSHOT_MANIFEST_FILE: &str = "snapshot.manifest";
const BINARY_SNAPSHOT_FILE: &str = "binary";
const PARTIAL_SUFFIX: &str = ".partial";
const RESTORE_STAGED_SUFFIX: &str = ".restored";
const RESTORE_RETIRED_SUFFIX: &str = ".failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: String,
    pub dir: PathBuf,
    pub version: String,
    pub binary_path: PathBuf,
    pub binary_sha256: String,
    pub created_at_unix: u64,
    pub subtrees: Vec<String>,
}

impl Backup {
    pub fn binary_snapshot(&self) -> PathBuf {
        self.dir.join(BINARY_SNAPSHOT_FILE)
    }

    pub fn subtree_snapshot(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn has_subtree(&self, name: &str) -> bool {
        self.subtrees.iter().any(|subtree| subtree == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_dir: PathBuf,
    pub binary_path: PathBuf,
    pub restored_subtrees: Vec<String>,
    pub removed_subtrees: Vec<String>,
}

pub fn create_backup(layout: &InstallLayout, binary_path: &Path, version: &str) -> Result<Backup> {
    let backups_dir = layout.backups_dir();
    fs::create_dir_all(&backups_dir)
        .with_context(|| format!("failed to create {}", backups_dir.display()))?;

    let id = allocate_backup_id(layout);
    let final_dir = layout.backup_path(&id);
    let partial_dir = sibling_path(&final_dir, PARTIAL_SUFFIX);
    remove_path_if_exists(&partial_dir)?;

    let assembled = assemble_backup(layout, &partial_dir, binary_path, version);
    let (binary_sha256, created_at_unix, subtrees) = match assembled {
        Ok(parts) => parts,
        Err(err) => {
            let _ = remove_path_if_exists(&partial_dir);
            return Err(err);
        }
    };

    fs::rename(&partial_dir, &final_dir).with_context(|| {
        format!(
            "failed to finalize backup {} -> {}",
            partial_dir.display(),
            final_dir.display()
        )
    })?;
    write_file_atomically(
        &layout.last_backup_path(),
        &format!("{}\n", final_dir.display()),
    )
    .context("failed to record last backup pointer")?;

    info!(backup = %final_dir.display(), %version, "backup created");
    Ok(Backup {
        id,
        dir: final_dir,
        version: version.to_string(),
        binary_path: binary_path.to_path_buf(),
        binary_sha256,
        created_at_unix,
        subtrees,
    })
}

fn assemble_backup(
    layout: &InstallLayout,
    partial_dir: &Path,
    binary_path: &Path,
    version: &str,
) -> Result<(String, u64, Vec<String>)> {
    fs::create_dir_all(partial_dir)
        .with_context(|| format!("failed to create {}", partial_dir.display()))?;

    let binary_snapshot = partial_dir.join(BINARY_SNAPSHOT_FILE);
    fs::copy(binary_path, &binary_snapshot).with_context(|| {
        format!(
            "failed to copy binary {} into backup",
            binary_path.display()
        )
    })?;
    let binary_sha256 = sha256_file_hex(&binary_snapshot)?;

    let mut subtrees = Vec::new();
    for name in RUNTIME_SUBTREES {
        let live = layout.runtime_subtree_dir(name);
        if !live.is_dir() {
            debug!(subtree = name, "runtime subtree absent; not backed up");
            continue;
        }
        copy_tree(&live, &partial_dir.join(name))
            .with_context(|| format!("failed to back up runtime subtree '{name}'"))?;
        subtrees.push(name.to_string());
    }

    let created_at_unix = current_unix_timestamp()?;
    let mut lines = vec![
        format!("version={version}"),
        format!("binary_path={}", binary_path.display()),
        format!("binary_sha256={binary_sha256}"),
        format!("created_at_unix={created_at_unix}"),
    ];
    lines.extend(subtrees.iter().map(|name| format!("subtree={name}")));
    let manifest_path = partial_dir.join(SNAPSHOT_MANIFEST_FILE);
    fs::write(&manifest_path, format!("{}\n", lines.join("\n")))
        .with_context(|| format!("failed writing snapshot manifest: {}", manifest_path.display()))?;

    Ok((binary_sha256, created_at_unix, subtrees))
}

fn allocate_backup_id(layout: &InstallLayout) -> String {
    let base = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    next_free_backup_id(layout, &base)
}

// Zero-padded so collision suffixes keep lexical order equal to creation order.
pub(crate) fn next_free_backup_id(layout: &InstallLayout, base: &str) -> String {
    let taken = |id: &str| {
        let dir = layout.backup_path(id);
        dir.exists() || sibling_path(&dir, PARTIAL_SUFFIX).exists()
    };
    let mut id = base.to_string();
    let mut suffix = 1u32;
    while taken(&id) {
        id = format!("{base}-{suffix:03}");
        suffix += 1;
    }
    id
}

pub fn load_backup(dir: &Path) -> Result<Backup> {
    let manifest_path = dir.join(SNAPSHOT_MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed reading snapshot manifest: {}", manifest_path.display()))?;

    let mut version = None;
    let mut binary_path = None;
    let mut binary_sha256 = String::new();
    let mut created_at_unix = 0;
    let mut subtrees = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "invalid snapshot manifest line '{line}' in {}",
                manifest_path.display()
            );
        };
        match key {
            "version" => version = Some(value.to_string()),
            "binary_path" => binary_path = Some(PathBuf::from(value)),
            "binary_sha256" => binary_sha256 = value.to_string(),
            "created_at_unix" => {
                created_at_unix = value.parse().with_context(|| {
                    format!("invalid created_at_unix in {}", manifest_path.display())
                })?;
            }
            "subtree" => subtrees.push(value.to_string()),
            _ => debug!(key, "ignoring unknown snapshot manifest key"),
        }
    }

    let id = dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("backup path has no usable name: {}", dir.display()))?
        .to_string();

    Ok(Backup {
        id,
        dir: dir.to_path_buf(),
        version: version
            .ok_or_else(|| anyhow!("snapshot manifest missing version: {}", manifest_path.display()))?,
        binary_path: binary_path.ok_or_else(|| {
            anyhow!(
                "snapshot manifest missing binary_path: {}",
                manifest_path.display()
            )
        })?,
        binary_sha256,
        created_at_unix,
        subtrees,
    })
}

pub fn list_backups(layout: &InstallLayout) -> Result<Vec<Backup>> {
    let backups_dir = layout.backups_dir();
    let entries = match fs::read_dir(&backups_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", backups_dir.display()));
        }
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to iterate {}", backups_dir.display()))?;
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
        if is_partial || !entry.file_type()?.is_dir() {
            continue;
        }
        match load_backup(&path) {
            Ok(backup) => backups.push(backup),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable backup"),
        }
    }

    backups.sort_by(|left, right| right.id.cmp(&left.id));
    Ok(backups)
}

pub fn read_last_backup_pointer(layout: &InstallLayout) -> Result<Option<PathBuf>> {
    let pointer = layout.last_backup_path();
    match fs::read_to_string(&pointer) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(PathBuf::from(raw.trim()))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", pointer.display())),
    }
}

pub fn resolve_restore_source(
    layout: &InstallLayout,
    explicit: Option<&Path>,
) -> Result<Backup, UpdateError> {
    let pointer = layout.last_backup_path();
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => {
            let target = read_last_backup_pointer(layout)
                .map_err(|err| UpdateError::io("failed to read last backup pointer", err))?;
            match target {
                Some(dir) if dir.is_dir() => dir,
                Some(dir) => {
                    warn!(target = %dir.display(), "last backup pointer names a missing directory");
                    return Err(UpdateError::NoBackupAvailable { pointer });
                }
                None => return Err(UpdateError::NoBackupAvailable { pointer }),
            }
        }
    };

    load_backup(&dir).map_err(|err| {
        UpdateError::io(format!("backup at {} is unusable", dir.display()), err)
    })
}

pub fn restore_backup(layout: &InstallLayout, backup: &Backup) -> Result<RestoreReport> {
    let snapshot = backup.binary_snapshot();
    if !snapshot.is_file() {
        bail!("backup binary missing: {}", snapshot.display());
    }
    if !backup.binary_sha256.is_empty() {
        let actual = sha256_file_hex(&snapshot)?;
        if actual != backup.binary_sha256 {
            bail!(
                "backup binary {} is corrupt: expected sha256 {}, got {}",
                snapshot.display(),
                backup.binary_sha256,
                actual
            );
        }
    }
    for name in &backup.subtrees {
        let snapshot = backup.subtree_snapshot(name);
        if !snapshot.is_dir() {
            bail!("backup subtree missing: {}", snapshot.display());
        }
    }

    clear_interrupted_swaps(layout)?;

    if let Some(parent) = backup.binary_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    replace_file_atomically(&snapshot, &backup.binary_path, true)
        .context("failed to restore binary")?;

    let runtime_dir = layout.runtime_dir();
    fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("failed to create {}", runtime_dir.display()))?;

    let mut restored_subtrees = Vec::new();
    let mut removed_subtrees = Vec::new();
    for name in RUNTIME_SUBTREES {
        let live = layout.runtime_subtree_dir(name);
        if backup.has_subtree(name) {
            swap_dir_into_place(
                &backup.subtree_snapshot(name),
                &live,
                RESTORE_STAGED_SUFFIX,
                RESTORE_RETIRED_SUFFIX,
            )
            .with_context(|| format!("failed to restore runtime subtree '{name}'"))?;
            restored_subtrees.push(name.to_string());
        } else if live.exists() {
            let retired = sibling_path(&live, RESTORE_RETIRED_SUFFIX);
            fs::rename(&live, &retired)
                .with_context(|| format!("failed to move {} aside", live.display()))?;
            remove_path_if_exists(&retired)?;
            removed_subtrees.push(name.to_string());
        }
    }

    info!(backup = %backup.dir.display(), version = %backup.version, "backup restored");
    Ok(RestoreReport {
        backup_dir: backup.dir.clone(),
        binary_path: backup.binary_path.clone(),
        restored_subtrees,
        removed_subtrees,
    })
}

fn clear_interrupted_swaps(layout: &InstallLayout) -> Result<()> {
    for name in RUNTIME_SUBTREES {
        let live = layout.runtime_subtree_dir(name);
        for suffix in [
            SWAP_STAGED_SUFFIX,
            SWAP_RETIRED_SUFFIX,
            RESTORE_STAGED_SUFFIX,
            RESTORE_RETIRED_SUFFIX,
        ] {
            let leftover = sibling_path(&live, suffix);
            if leftover.exists() {
                debug!(path = %leftover.display(), "removing leftover from interrupted swap");
                remove_path_if_exists(&leftover)?;
            }
        }
    }
    Ok(())
}

pub fn prune_backups(layout: &InstallLayout, keep: usize) -> Result<Vec<PathBuf>> {
    let pointer_target = read_last_backup_pointer(layout)?;
    let mut removed = Vec::new();
    for backup in list_backups(layout)?.into_iter().skip(keep) {
        if pointer_target.as_deref() == Some(backup.dir.as_path()) {
            debug!(backup = %backup.dir.display(), "keeping backup named by last_backup");
            continue;
        }
        fs::remove_dir_all(&backup.dir)
            .with_context(|| format!("failed to remove old backup {}", backup.dir.display()))?;
        info!(backup = %backup.dir.display(), "pruned old backup");
        removed.push(backup.dir);
    }
    Ok(removed)
}
