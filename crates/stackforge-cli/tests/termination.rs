#![cfg(unix)]

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn interrupt_at_confirmation_prompt_releases_lock() {
    let root = test_root("sigint");
    let home = root.join("user");
    let install_root = root.join("install");
    let mirror = root.join("mirror");

    let binary = home.join(".local").join("bin").join("stackforge");
    write_executable(
        &binary,
        "#!/bin/sh\ncase \"$1\" in\n  --version) echo \"stackforge 0.0.1\" ;;\n  *) exit 0 ;;\nesac\n",
    );
    fs::create_dir_all(install_root.join("runtime").join("lib")).expect("must create runtime");
    fs::create_dir_all(mirror.join("v99.0.0")).expect("must create release dir");

    let mut child = Command::new(env!("CARGO_BIN_EXE_stackforge"))
        .arg("update")
        .arg("--root")
        .arg(&install_root)
        .arg("--release-root")
        .arg(&mirror)
        .env("HOME", &home)
        .env("NO_COLOR", "1")
        .env_remove("STACKFORGE_HOME")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("stackforge must start");

    let mut stderr = child.stderr.take().expect("stderr must be piped");
    let mut seen = Vec::new();
    let mut byte = [0u8; 1];
    while !String::from_utf8_lossy(&seen).contains("[y/N]") {
        let read = stderr.read(&mut byte).expect("must read stderr");
        assert!(
            read > 0,
            "stackforge exited before prompting: {}",
            String::from_utf8_lossy(&seen)
        );
        seen.push(byte[0]);
    }
    let lock_path = install_root.join(".lock");
    assert!(lock_path.exists(), "lock must be held while prompting");

    let status = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("kill must start");
    assert!(status.success());

    let exit = child.wait().expect("stackforge must exit");
    assert_eq!(exit.code(), Some(130));
    assert!(!lock_path.exists(), "lock must be released on interrupt");

    let _ = fs::remove_dir_all(&root);
}

fn write_executable(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent");
    }
    fs::write(path, content).expect("must write executable");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("must set exec bit");
}

fn test_root(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "stackforge-cli-{label}-{}-{nanos}",
        std::process::id()
    ))
}
