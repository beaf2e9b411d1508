use anyhow::{anyhow, Context, Result};
use stackforge_core::Version;
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub version_output: String,
    pub reported_version: Option<Version>,
}

pub fn verify_installed_binary(
    binary: &Path,
    expected: Option<&Version>,
) -> Result<VerificationReport> {
    let version_output = run_binary_with_flag(binary, "--version")?;
    let reported_version = parse_reported_version(&version_output);
    debug!(
        binary = %binary.display(),
        output = %version_output.trim(),
        "installed binary answered --version"
    );

    if let Some(expected) = expected {
        match &reported_version {
            Some(reported) if reported == expected => {}
            Some(reported) => {
                return Err(anyhow!(
                    "installed binary reports version {reported}, expected {expected}"
                ));
            }
            None => {
                return Err(anyhow!(
                    "installed binary did not report a version (output: '{}'), expected {expected}",
                    version_output.trim()
                ));
            }
        }
    }

    run_binary_with_flag(binary, "--help")?;
    Ok(VerificationReport {
        version_output,
        reported_version,
    })
}

pub fn parse_reported_version(output: &str) -> Option<Version> {
    output
        .split_whitespace()
        .rev()
        .find_map(|token| Version::parse(token).ok())
}

fn run_binary_with_flag(binary: &Path, flag: &str) -> Result<String> {
    let output = spawn_with_retry(binary, flag)
        .with_context(|| format!("failed to run {} {flag}", binary.display()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} {flag} exited with {}: stdout='{}' stderr='{}'",
            binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ETXTBSY: a concurrent fork elsewhere in the process can briefly hold a
// write descriptor to the freshly written binary.
fn spawn_with_retry(binary: &Path, flag: &str) -> std::io::Result<Output> {
    const TEXT_FILE_BUSY: i32 = 26;
    let mut attempts = 0;
    loop {
        match Command::new(binary).arg(flag).output() {
            Err(err) if err.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(50));
            }
            result => return result,
        }
    }
}
