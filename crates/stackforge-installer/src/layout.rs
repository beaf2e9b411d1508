use anyhow::{Context, Result};
use stackforge_core::binary_file_name;
use std::fs;
use std::path::{Path, PathBuf};

use crate::fs_utils::current_unix_nanos;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
    binary_candidates: Vec<PathBuf>,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            binary_candidates: default_binary_candidates(),
        }
    }

    pub fn with_binary_candidates(root: impl Into<PathBuf>, candidates: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            binary_candidates: candidates,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_candidates(&self) -> &[PathBuf] {
        &self.binary_candidates
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn runtime_subtree_dir(&self, name: &str) -> PathBuf {
        self.runtime_dir().join(name)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn backup_path(&self, id: &str) -> PathBuf {
        self.backups_dir().join(id)
    }

    pub fn last_backup_path(&self) -> PathBuf {
        self.root.join("last_backup")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn swap_marker_path(&self) -> PathBuf {
        self.root.join(".update-in-progress")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.cache_dir().join("scratch")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("update.toml")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.backups_dir(),
            self.cache_dir(),
            self.scratch_root(),
            self.config_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn make_scratch_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self.scratch_root().join(format!(
            "{}-{}-{}",
            prefix,
            std::process::id(),
            current_unix_nanos()?
        ));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed creating scratch dir: {}", dir.display()))?;
        Ok(dir)
    }
}

pub fn default_install_root() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("STACKFORGE_HOME") {
        return Ok(PathBuf::from(home));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows install root")?;
        return Ok(PathBuf::from(app_data).join("Stackforge"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve install root")?;
    Ok(PathBuf::from(home).join(".stackforge"))
}

pub fn default_binary_candidates() -> Vec<PathBuf> {
    let file_name = binary_file_name();
    let mut candidates = Vec::new();

    if cfg!(windows) {
        if let Some(app_data) = std::env::var_os("LOCALAPPDATA") {
            candidates.push(
                PathBuf::from(app_data)
                    .join("Programs")
                    .join("stackforge")
                    .join(&file_name),
            );
        }
        if let Some(program_files) = std::env::var_os("ProgramFiles") {
            candidates.push(
                PathBuf::from(program_files)
                    .join("stackforge")
                    .join(&file_name),
            );
        }
        return candidates;
    }

    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".local").join("bin").join(&file_name));
    }
    candidates.push(PathBuf::from("/usr/local/bin").join(&file_name));
    candidates
}
