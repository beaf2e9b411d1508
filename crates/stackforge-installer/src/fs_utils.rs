use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn current_unix_nanos() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos())
}

pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat source path: {}", src.display()))?;

    if metadata.is_dir() {
        fs::create_dir_all(dst)
            .with_context(|| format!("failed to create directory: {}", dst.display()))?;
        for entry in
            fs::read_dir(src).with_context(|| format!("failed to read directory: {}", src.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", src.display()))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink: {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to copy symlink {} -> {}",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(());
    }

    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

pub fn replace_file_atomically(src: &Path, dest: &Path, executable: bool) -> Result<()> {
    let staged = sibling_path(dest, &format!(".stackforge-new-{}", std::process::id()));
    remove_file_if_exists(&staged)
        .with_context(|| format!("failed to clear stale {}", staged.display()))?;

    let result = (|| -> Result<()> {
        fs::copy(src, &staged).with_context(|| {
            format!("failed to stage {} at {}", src.display(), staged.display())
        })?;
        if executable {
            set_executable(&staged)?;
        }
        fs::File::open(&staged)
            .and_then(|file| file.sync_all())
            .with_context(|| format!("failed to sync {}", staged.display()))?;
        fs::rename(&staged, dest).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                staged.display(),
                dest.display()
            )
        })
    })();

    if result.is_err() {
        let _ = remove_file_if_exists(&staged);
    }
    result
}

pub fn write_file_atomically(path: &Path, contents: &str) -> Result<()> {
    let tmp = sibling_path(path, ".tmp");
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))
    })();

    if result.is_err() {
        let _ = remove_file_if_exists(&tmp);
    }
    result
}

// If the final rename fails the retired tree is moved back.
pub fn swap_dir_into_place(
    replacement: &Path,
    live: &Path,
    staged_suffix: &str,
    retired_suffix: &str,
) -> Result<()> {
    let staged = sibling_path(live, staged_suffix);
    let retired = sibling_path(live, retired_suffix);
    remove_path_if_exists(&staged)?;
    remove_path_if_exists(&retired)?;

    copy_tree(replacement, &staged)
        .with_context(|| format!("failed to stage {}", staged.display()))?;

    let had_live = live.exists();
    if had_live {
        fs::rename(live, &retired).with_context(|| {
            format!("failed to move {} aside to {}", live.display(), retired.display())
        })?;
    }

    if let Err(err) = fs::rename(&staged, live) {
        if had_live {
            let _ = fs::rename(&retired, live);
        }
        let _ = remove_path_if_exists(&staged);
        return Err(err).with_context(|| {
            format!("failed to move {} into place", live.display())
        });
    }

    remove_path_if_exists(&retired)
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .with_context(|| format!("failed to read metadata: {}", path.display()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to mark executable: {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
