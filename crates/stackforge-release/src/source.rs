use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use stackforge_core::Version;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::checksum::parse_checksum_text;

pub const ARCHIVE_FILE_NAME: &str = "stackforge.tar.gz";
pub const CHECKSUM_FILE_NAME: &str = "stackforge.tar.gz.sha256";

pub trait ReleaseSource {
    fn list_tags(&self) -> Result<Vec<String>>;

    fn archive_location(&self, version: &Version) -> String;

    fn download_archive(&self, version: &Version, dest: &Path) -> Result<()>;

    fn expected_sha256(&self, version: &Version) -> Result<Option<String>>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub releases_url: String,
    pub archive_url_template: String,
    pub checksum_url_template: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct HttpReleaseSource {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpReleaseSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("stackforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn archive_url(&self, version: &Version) -> String {
        expand_url_template(&self.config.archive_url_template, version)
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        debug!(%url, "GET");
        self.client
            .get(url)
            .send()
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("request returned error status: {url}"))
    }
}

impl ReleaseSource for HttpReleaseSource {
    fn list_tags(&self) -> Result<Vec<String>> {
        let body = self
            .get(&self.config.releases_url)?
            .text()
            .with_context(|| format!("failed reading body: {}", self.config.releases_url))?;
        Ok(parse_release_listing(&body))
    }

    fn archive_location(&self, version: &Version) -> String {
        self.archive_url(version)
    }

    fn download_archive(&self, version: &Version, dest: &Path) -> Result<()> {
        let url = self.archive_url(version);
        let mut response = self.get(&url)?;
        write_via_part_file(dest, |file| {
            response
                .copy_to(file)
                .map(|_| ())
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        })
        .with_context(|| format!("failed to download {url}"))
    }

    fn expected_sha256(&self, version: &Version) -> Result<Option<String>> {
        let Some(template) = &self.config.checksum_url_template else {
            return Ok(None);
        };
        let url = expand_url_template(template, version);
        let body = self
            .get(&url)?
            .text()
            .with_context(|| format!("failed reading body: {url}"))?;
        let digest =
            parse_checksum_text(&body).with_context(|| format!("invalid checksum at {url}"))?;
        Ok(Some(digest))
    }

    fn describe(&self) -> String {
        self.config.releases_url.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReleaseSource {
    root: PathBuf,
}

impl LocalReleaseSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn release_dir(&self, version: &Version) -> Result<PathBuf> {
        for candidate in [format!("v{version}"), version.to_string()] {
            let dir = self.root.join(candidate);
            if dir.is_dir() {
                return Ok(dir);
            }
        }
        Err(anyhow!(
            "release {version} not found in mirror {}",
            self.root.display()
        ))
    }
}

impl ReleaseSource for LocalReleaseSource {
    fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read release mirror: {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                tags.push(name.to_string());
            }
        }
        tags.sort();
        Ok(tags)
    }

    fn archive_location(&self, version: &Version) -> String {
        match self.release_dir(version) {
            Ok(dir) => dir.join(ARCHIVE_FILE_NAME).display().to_string(),
            Err(_) => self
                .root
                .join(format!("v{version}"))
                .join(ARCHIVE_FILE_NAME)
                .display()
                .to_string(),
        }
    }

    fn download_archive(&self, version: &Version, dest: &Path) -> Result<()> {
        let src = self.release_dir(version)?.join(ARCHIVE_FILE_NAME);
        write_via_part_file(dest, |file| {
            let mut reader = fs::File::open(&src)?;
            io::copy(&mut reader, file).map(|_| ())
        })
        .with_context(|| format!("failed to copy release archive {}", src.display()))
    }

    fn expected_sha256(&self, version: &Version) -> Result<Option<String>> {
        let path = self.release_dir(version)?.join(CHECKSUM_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read checksum: {}", path.display()));
            }
        };
        let digest = parse_checksum_text(&raw)
            .with_context(|| format!("invalid checksum file: {}", path.display()))?;
        Ok(Some(digest))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingEntry {
    Tag(String),
    Release { tag_name: String },
}

pub fn parse_release_listing(raw: &str) -> Vec<String> {
    let items = match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "release listing is not a JSON array; treating as empty");
            return Vec::new();
        }
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ListingEntry>(item) {
            Ok(ListingEntry::Tag(tag)) => Some(tag),
            Ok(ListingEntry::Release { tag_name }) => Some(tag_name),
            Err(_) => None,
        })
        .collect()
}

pub fn expand_url_template(template: &str, version: &Version) -> String {
    template
        .replace("{tag}", &format!("v{version}"))
        .replace("{version}", &version.to_string())
        .replace("{target}", host_target_triple())
}

pub fn host_target_triple() -> &'static str {
    match (std::env::consts::ARCH, std::env::consts::OS) {
        ("x86_64", "linux") => "x86_64-unknown-linux-gnu",
        ("aarch64", "linux") => "aarch64-unknown-linux-gnu",
        ("x86_64", "macos") => "x86_64-apple-darwin",
        ("aarch64", "macos") => "aarch64-apple-darwin",
        ("x86_64", "windows") => "x86_64-pc-windows-msvc",
        ("aarch64", "windows") => "aarch64-pc-windows-msvc",
        _ => "unknown-unknown-unknown",
    }
}

fn write_via_part_file<F>(dest: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let part_path = dest.with_file_name(format!(
        "{}.part",
        dest.file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("artifact")
    ));

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&part_path)?;
        fill(&mut file)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&part_path);
        return Err(err).with_context(|| format!("failed to write {}", part_path.display()));
    }

    fs::rename(&part_path, dest)
        .with_context(|| format!("failed to move download into place: {}", dest.display()))
}
