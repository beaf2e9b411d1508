use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed version '{input}': {reason}")]
pub struct MalformedVersion {
    pub input: String,
    pub reason: String,
}

impl MalformedVersion {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// Release outranks any pre-release of the same core; pre-release tags compare as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, MalformedVersion> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(MalformedVersion::new(input, "empty version"));
        }

        let (core, pre) = match body.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (body, None),
        };

        let parts = core.split('.').collect::<Vec<_>>();
        if parts.len() > 3 {
            return Err(MalformedVersion::new(
                input,
                format!("expected at most 3 numeric components, found {}", parts.len()),
            ));
        }

        let mut numbers = [0_u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MalformedVersion::new(
                    input,
                    format!("component '{part}' is not a non-negative integer"),
                ));
            }
            *slot = part.parse().map_err(|_| {
                MalformedVersion::new(input, format!("component '{part}' is out of range"))
            })?;
        }

        let pre = match pre {
            None => None,
            Some("") => return Err(MalformedVersion::new(input, "empty pre-release tag")),
            Some(tag) => {
                semver::Prerelease::new(tag).map_err(|err| {
                    MalformedVersion::new(input, format!("invalid pre-release tag: {err}"))
                })?;
                Some(tag.to_string())
            }
        };

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.pre.as_deref()
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core()
            .cmp(&other.core())
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(left), Some(right)) => left.cmp(right),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = MalformedVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn compare(a: &str, b: &str) -> Result<Ordering, MalformedVersion> {
    let left = Version::parse(a)?;
    let right = Version::parse(b)?;
    Ok(left.cmp(&right))
}

pub fn resolve_latest<I, S>(candidates: I) -> Option<Version>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    candidates
        .into_iter()
        .filter_map(|candidate| match Version::parse(candidate.as_ref()) {
            Ok(version) => Some(version),
            Err(err) => {
                debug!(error = %err, "skipping release tag");
                None
            }
        })
        .max()
}
