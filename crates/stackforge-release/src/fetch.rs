use anyhow::{anyhow, Context, Result};
use stackforge_core::{binary_file_name, Version, REQUIRED_SUBTREE, RUNTIME_SUBTREES};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::checksum::verify_sha256_file;
use crate::source::{ReleaseSource, ARCHIVE_FILE_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRelease {
    pub version: Version,
    pub payload_root: PathBuf,
    pub binary_path: PathBuf,
    pub subtrees: Vec<&'static str>,
}

impl FetchedRelease {
    pub fn subtree_path(&self, name: &str) -> PathBuf {
        self.payload_root.join(name)
    }
}

pub fn fetch_release(
    source: &dyn ReleaseSource,
    version: &Version,
    scratch_dir: &Path,
) -> Result<FetchedRelease> {
    fs::create_dir_all(scratch_dir)
        .with_context(|| format!("failed to create scratch dir: {}", scratch_dir.display()))?;

    let archive_path = scratch_dir.join(ARCHIVE_FILE_NAME);
    info!(
        %version,
        from = %source.archive_location(version),
        "downloading release archive"
    );
    source.download_archive(version, &archive_path)?;

    match source.expected_sha256(version)? {
        Some(expected) => {
            verify_sha256_file(&archive_path, &expected)?;
            debug!(sha256 = %expected, "release archive checksum verified");
        }
        None => debug!("release source publishes no checksum; skipping verification"),
    }

    let unpacked_dir = scratch_dir.join("unpacked");
    fs::create_dir_all(&unpacked_dir)
        .with_context(|| format!("failed to create {}", unpacked_dir.display()))?;
    extract_tar(&archive_path, &unpacked_dir)?;

    stage_unpacked_release(version, &unpacked_dir)
}

pub fn stage_unpacked_release(version: &Version, unpacked_dir: &Path) -> Result<FetchedRelease> {
    let payload_root = locate_payload_root(unpacked_dir)?;
    let binary_path = payload_root.join(binary_file_name());
    if !binary_path.is_file() {
        return Err(anyhow!(
            "release {version} does not contain the {} entry point (looked in {})",
            binary_file_name(),
            payload_root.display()
        ));
    }

    if !payload_root.join(REQUIRED_SUBTREE).is_dir() {
        return Err(anyhow!(
            "release {version} does not contain the '{REQUIRED_SUBTREE}' runtime subtree (looked in {})",
            payload_root.display()
        ));
    }

    let subtrees = RUNTIME_SUBTREES
        .into_iter()
        .filter(|name| payload_root.join(name).is_dir())
        .collect();

    Ok(FetchedRelease {
        version: version.clone(),
        payload_root,
        binary_path,
        subtrees,
    })
}

fn locate_payload_root(unpacked_dir: &Path) -> Result<PathBuf> {
    if unpacked_dir.join(binary_file_name()).exists() {
        return Ok(unpacked_dir.to_path_buf());
    }

    let entries = fs::read_dir(unpacked_dir)
        .with_context(|| format!("failed to read {}", unpacked_dir.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read {}", unpacked_dir.display()))?;

    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }

    Ok(unpacked_dir.to_path_buf())
}

fn extract_tar(archive_path: &Path, dst: &Path) -> Result<()> {
    run_command(
        Command::new("tar")
            .arg("-xzf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract release archive",
    )
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
