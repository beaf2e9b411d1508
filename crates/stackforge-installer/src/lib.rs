mod backup;
mod engine;
mod error;
mod fs_utils;
mod layout;
mod lock;
mod recovery;
mod state;
mod swap;
mod verify;

pub use backup::{
    create_backup, list_backups, load_backup, prune_backups, read_last_backup_pointer,
    resolve_restore_source, restore_backup, Backup, RestoreReport, DEFAULT_KEEP_BACKUPS,
};
pub use engine::{
    check_for_update, resolve_target_version, rollback_installation, CheckReport, CheckStatus,
    SilentReporter, UpdateEngine, UpdateOptions, UpdateOutcome, UpdatePhase, UpdatePlan,
    UpdateReporter, UpdateSummary,
};
pub use error::UpdateError;
pub use fs_utils::{copy_tree, current_unix_timestamp};
pub use layout::{default_binary_candidates, default_install_root, InstallLayout};
pub use lock::{
    acquire_lock, force_clear_lock, inspect_lock, lock_owner_alive, release_held_locks,
    LockHandle, LockOptions, LockRecord, LockState, ReleaseOutcome, DEFAULT_LOCK_POLL_INTERVAL,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_STALE_LOCK_AFTER,
};
pub use recovery::read_swap_marker;
pub use state::{locate_installed_binary, validate_installation, ValidatedInstall};
pub use verify::{parse_reported_version, verify_installed_binary, VerificationReport};
