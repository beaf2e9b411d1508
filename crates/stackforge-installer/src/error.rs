use stackforge_core::MalformedVersion;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::lock::LockState;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    MalformedVersion(#[from] MalformedVersion),

    #[error(
        "another operation appears to be running ({}); gave up after {waited:?}, inspect lock file {}",
        describe_holder(.holder),
        .path.display()
    )]
    LockTimeout {
        path: PathBuf,
        holder: Option<LockState>,
        waited: Duration,
    },

    #[error("installation is not valid for {operation}: {reason}; reinstall stackforge")]
    InvalidInstallation { operation: String, reason: String },

    #[error("no releases found at {location}")]
    NoReleasesFound { location: String },

    #[error("failed to fetch release {version}: {source:#}")]
    Fetch {
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to create backup: {source:#}")]
    Backup {
        #[source]
        source: anyhow::Error,
    },

    #[error("install failed during {step}; restored backup {}: {source:#}", .backup.display())]
    Swap {
        step: String,
        backup: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "verification of {} failed; restored backup {}: {source:#}",
        .binary.display(),
        .backup.display()
    )]
    Verification {
        binary: PathBuf,
        backup: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "rollback from {} failed after: {cause}; installation state is indeterminate, restore manually from that directory: {source:#}",
        .backup.display()
    )]
    RollbackFailed {
        backup: PathBuf,
        cause: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no backup available to restore from (pointer file: {})", .pointer.display())]
    NoBackupAvailable { pointer: PathBuf },

    #[error("{context}: {source:#}")]
    Io {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl UpdateError {
    pub(crate) fn io(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Io {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::MalformedVersion(_) => 2,
            Self::LockTimeout { .. } => 3,
            Self::InvalidInstallation { .. } => 4,
            Self::NoReleasesFound { .. } | Self::Fetch { .. } => 5,
            Self::Swap { .. } => 6,
            Self::Verification { .. } => 7,
            Self::RollbackFailed { .. } => 8,
            Self::Backup { .. } | Self::NoBackupAvailable { .. } | Self::Io { .. } => 1,
        }
    }

    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::Swap { .. } | Self::Verification { .. })
    }
}

fn describe_holder(holder: &Option<LockState>) -> String {
    match holder {
        Some(LockState::Held(record)) => format!(
            "lock held by pid {} for '{}' since unix time {}",
            record.owner_pid, record.operation, record.acquired_at_unix
        ),
        Some(LockState::Unreadable(raw)) => format!("lock file content unreadable: '{raw}'"),
        None => "lock holder unknown".to_string(),
    }
}
