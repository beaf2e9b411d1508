// Ownership is proved by content: a handle only deletes the file while it still holds the line it wrote.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::fs_utils::{current_unix_nanos, current_unix_timestamp, sibling_path};
use crate::layout::InstallLayout;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(600);

// Locks this process currently owns, so exit paths can release them.
static HELD_LOCKS: Mutex<BTreeMap<PathBuf, String>> = Mutex::new(BTreeMap::new());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub operation: String,
    pub acquired_at_unix: u64,
}

impl LockRecord {
    pub fn for_current_process(operation: &str) -> Result<Self> {
        Ok(Self {
            owner_pid: std::process::id(),
            operation: sanitize_operation(operation),
            acquired_at_unix: current_unix_timestamp()?,
        })
    }

    pub fn serialize(&self) -> String {
        format!(
            "{}:{}:{}",
            self.owner_pid, self.operation, self.acquired_at_unix
        )
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let line = raw.trim();
        let (pid, rest) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("lock content '{line}' has no owner field"))?;
        let (operation, timestamp) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("lock content '{line}' has no timestamp field"))?;

        Ok(Self {
            owner_pid: pid
                .parse()
                .with_context(|| format!("invalid owner pid in lock content '{line}'"))?,
            operation: operation.to_string(),
            acquired_at_unix: timestamp
                .parse()
                .with_context(|| format!("invalid timestamp in lock content '{line}'"))?,
        })
    }

    pub fn age(&self, now_unix: u64) -> Duration {
        Duration::from_secs(now_unix.saturating_sub(self.acquired_at_unix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Held(LockRecord),
    Unreadable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    AlreadyGone,
}

#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record: LockRecord,
    content: String,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) -> Result<ReleaseOutcome> {
        self.released = true;
        release_owned(&self.path, &self.content)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_owned(&self.path, &self.content) {
            warn!(path = %self.path.display(), error = %err, "failed to release lock on drop");
        }
    }
}

pub fn acquire_lock(
    layout: &InstallLayout,
    operation: &str,
    options: LockOptions,
) -> Result<LockHandle, UpdateError> {
    let path = layout.lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            UpdateError::io(format!("failed to create {}", parent.display()), err)
        })?;
    }

    let started = Instant::now();
    let deadline = started + options.timeout;
    loop {
        let record = LockRecord::for_current_process(operation)
            .map_err(|err| UpdateError::io("failed to build lock record", err))?;
        let content = record.serialize();

        match try_create_lock_file(&path, &content) {
            Ok(()) => {
                // Re-read to detect a racing stale-lock cleaner that replaced our file.
                match fs::read_to_string(&path) {
                    Ok(raw) if raw.trim() == content => {
                        register_held_lock(&path, &content);
                        info!(path = %path.display(), operation = %record.operation, "lock acquired");
                        return Ok(LockHandle {
                            path,
                            record,
                            content,
                            released: false,
                        });
                    }
                    Ok(_) | Err(_) => {
                        debug!(path = %path.display(), "lock file changed right after creation; retrying");
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match read_lock_state(&path) {
                    Ok(None) => continue,
                    Ok(Some(LockState::Held(holder))) => {
                        if is_stale(&holder, options.stale_after) {
                            let stale = holder.serialize();
                            match remove_if_content_matches(&path, &stale) {
                                Ok(true) => {
                                    warn!(
                                        path = %path.display(),
                                        owner_pid = holder.owner_pid,
                                        operation = %holder.operation,
                                        "cleared stale lock left by a dead process"
                                    );
                                    continue;
                                }
                                Ok(false) => continue,
                                Err(err) => {
                                    debug!(error = %err, "could not clear stale lock");
                                }
                            }
                        }
                    }
                    Ok(Some(LockState::Unreadable(_))) => {}
                    Err(err) => {
                        debug!(error = %err, "could not read lock file");
                    }
                }
            }
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed to create lock file {}", path.display()),
                    err,
                ));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            let holder = read_lock_state(&path).ok().flatten();
            return Err(UpdateError::LockTimeout {
                path,
                holder,
                waited: started.elapsed(),
            });
        }
        std::thread::sleep(options.poll_interval.min(deadline - now));
    }
}

pub fn inspect_lock(layout: &InstallLayout) -> Result<Option<LockState>> {
    read_lock_state(&layout.lock_path())
}

pub fn lock_owner_alive(state: &LockState) -> bool {
    match state {
        LockState::Held(record) => process_alive(record.owner_pid),
        LockState::Unreadable(_) => true,
    }
}

pub fn force_clear_lock(layout: &InstallLayout) -> Result<Option<LockState>> {
    let path = layout.lock_path();
    let state = read_lock_state(&path)?;
    if state.is_some() {
        match fs::remove_file(&path) {
            Ok(()) => warn!(path = %path.display(), "lock file removed by operator"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove lock file {}", path.display()));
            }
        }
    }
    Ok(state)
}

pub fn release_held_locks() {
    release_registered_locks(|_| true);
}

pub(crate) fn release_registered_locks(select: impl Fn(&Path) -> bool) {
    let held = {
        let mut guard = HELD_LOCKS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let selected = guard
            .keys()
            .filter(|path| select(path))
            .cloned()
            .collect::<Vec<_>>();
        selected
            .into_iter()
            .filter_map(|path| guard.remove(&path).map(|content| (path, content)))
            .collect::<Vec<_>>()
    };

    for (path, content) in held {
        if let Err(err) = remove_if_content_matches(&path, &content) {
            warn!(path = %path.display(), error = %err, "failed to release lock at exit");
        }
    }
}

fn try_create_lock_file(path: &Path, content: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let written = file
        .write_all(content.as_bytes())
        .and_then(|()| file.flush());
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn read_lock_state(path: &Path) -> Result<Option<LockState>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock file {}", path.display()));
        }
    };

    Ok(Some(match LockRecord::parse(&raw) {
        Ok(record) => LockState::Held(record),
        Err(_) => LockState::Unreadable(raw.trim().to_string()),
    }))
}

fn release_owned(path: &Path, content: &str) -> Result<ReleaseOutcome> {
    unregister_held_lock(path);
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "lock already gone at release");
            return Ok(ReleaseOutcome::AlreadyGone);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock file {}", path.display()));
        }
    };

    if raw.trim() != content {
        warn!(
            path = %path.display(),
            found = %raw.trim(),
            "lock file no longer ours; leaving it in place"
        );
        return Ok(ReleaseOutcome::NotOwner);
    }

    if remove_if_content_matches(path, content)? {
        debug!(path = %path.display(), "lock released");
        Ok(ReleaseOutcome::Released)
    } else if path.exists() {
        Ok(ReleaseOutcome::NotOwner)
    } else {
        Ok(ReleaseOutcome::AlreadyGone)
    }
}

// Claims the file by renaming it to a private tombstone first, so a lock
// created by someone else after our read can never be deleted by us.
pub(crate) fn remove_if_content_matches(path: &Path, expected: &str) -> Result<bool> {
    let tombstone = tombstone_path(path)?;
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to claim lock file {}", path.display()));
        }
    }

    let raw = match fs::read_to_string(&tombstone) {
        Ok(raw) => raw,
        Err(err) => {
            reinstate_claimed_lock(path, &tombstone)?;
            return Err(err)
                .with_context(|| format!("failed to read claimed lock {}", tombstone.display()));
        }
    };
    if raw.trim() == expected {
        fs::remove_file(&tombstone)
            .with_context(|| format!("failed to remove {}", tombstone.display()))?;
        return Ok(true);
    }

    debug!(path = %path.display(), found = %raw.trim(), "claimed lock changed owner; putting it back");
    reinstate_claimed_lock(path, &tombstone)?;
    Ok(false)
}

// hard_link never replaces an existing file, unlike rename.
fn reinstate_claimed_lock(path: &Path, tombstone: &Path) -> Result<()> {
    match fs::hard_link(tombstone, path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(
                path = %path.display(),
                "lock file was recreated while a claimed copy was out; dropping the copy"
            );
        }
        Err(_) => {
            return fs::rename(tombstone, path).with_context(|| {
                format!("failed to restore lock file {}", path.display())
            });
        }
    }
    fs::remove_file(tombstone).with_context(|| format!("failed to remove {}", tombstone.display()))
}

fn tombstone_path(path: &Path) -> Result<PathBuf> {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(sibling_path(
        path,
        &format!(
            ".stale-{}-{}-{sequence}",
            std::process::id(),
            current_unix_nanos()?
        ),
    ))
}

fn is_stale(holder: &LockRecord, stale_after: Duration) -> bool {
    let now = match current_unix_timestamp() {
        Ok(now) => now,
        Err(_) => return false,
    };
    holder.age(now) > stale_after && !process_alive(holder.owner_pid)
}

fn register_held_lock(path: &Path, content: &str) {
    HELD_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(path.to_path_buf(), content.to_string());
}

fn unregister_held_lock(path: &Path) {
    HELD_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(path);
}

fn sanitize_operation(operation: &str) -> String {
    let cleaned: String = operation
        .chars()
        .map(|ch| {
            if ch == ':' || ch.is_whitespace() {
                '-'
            } else {
                ch
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// An owner check that fails counts as alive so a live lock is never cleared.
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    #[cfg(target_os = "linux")]
    if Path::new("/proc/self").exists() {
        return Path::new("/proc").join(pid.to_string()).exists();
    }

    #[cfg(unix)]
    {
        match Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => true,
        }
    }

    #[cfg(windows)]
    {
        match Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
            Err(_) => true,
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        true
    }
}
