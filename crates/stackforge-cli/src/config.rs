use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use stackforge_installer::{LockOptions, DEFAULT_KEEP_BACKUPS};
use stackforge_release::HttpSourceConfig;

pub(crate) const DEFAULT_RELEASES_URL: &str =
    "https://api.github.com/repos/stackforge-dev/stackforge/releases";
pub(crate) const DEFAULT_ARCHIVE_URL_TEMPLATE: &str =
    "https://github.com/stackforge-dev/stackforge/releases/download/{tag}/stackforge-{target}.tar.gz";
pub(crate) const DEFAULT_CHECKSUM_URL_TEMPLATE: &str =
    "https://github.com/stackforge-dev/stackforge/releases/download/{tag}/stackforge-{target}.tar.gz.sha256";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct UpdateConfig {
    pub releases_url: String,
    pub archive_url_template: String,
    pub checksum_url_template: String,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub stale_lock_secs: u64,
    pub keep_backups: usize,
    pub http_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            releases_url: DEFAULT_RELEASES_URL.to_string(),
            archive_url_template: DEFAULT_ARCHIVE_URL_TEMPLATE.to_string(),
            checksum_url_template: DEFAULT_CHECKSUM_URL_TEMPLATE.to_string(),
            lock_timeout_secs: 30,
            lock_poll_interval_ms: 1000,
            stale_lock_secs: 600,
            keep_backups: DEFAULT_KEEP_BACKUPS,
            http_timeout_secs: 120,
        }
    }
}

impl UpdateConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config {}", path.display()));
            }
        };
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse update config")?;
        Ok(config)
    }

    pub(crate) fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_secs(self.lock_timeout_secs),
            poll_interval: Duration::from_millis(self.lock_poll_interval_ms.max(1)),
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }

    pub(crate) fn http_source_config(&self) -> HttpSourceConfig {
        let checksum = self.checksum_url_template.trim();
        HttpSourceConfig {
            releases_url: self.releases_url.clone(),
            archive_url_template: self.archive_url_template.clone(),
            checksum_url_template: (!checksum.is_empty()).then(|| checksum.to_string()),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}
