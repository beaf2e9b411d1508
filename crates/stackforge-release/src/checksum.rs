use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub fn sha256_hex_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    sha256_hex_reader(&mut file).with_context(|| format!("failed to hash {}", path.display()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<()> {
    let expected = expected_hex.trim().to_ascii_lowercase();
    let actual = sha256_file_hex(path)?;
    if actual != expected {
        return Err(anyhow!(
            "sha256 mismatch for {}: expected={} actual={}",
            path.display(),
            expected,
            actual
        ));
    }
    Ok(())
}

pub fn parse_checksum_text(raw: &str) -> Result<String> {
    let token = raw
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("checksum file is empty"))?;
    if token.len() != 64 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow!("checksum is not a sha256 hex digest: '{token}'"));
    }
    Ok(token.to_ascii_lowercase())
}
