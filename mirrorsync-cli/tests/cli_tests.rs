//! End-to-end checks of the `mirrorsync` binary's offline subcommands

use mirrorsync_core::core_ledger::{SqlLedger, SyncLedger};
use mirrorsync_core::{MirrorConfig, SyncRecord};
use std::process::Command;
use tempfile::TempDir;

fn mirrorsync() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mirrorsync"));
    cmd.env_remove("MIRRORSYNC_WORKSPACE_ROOT");
    cmd
}

#[test]
fn test_init_config_writes_loadable_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mirror.toml");

    let output = mirrorsync()
        .args(["init-config", path.to_str().unwrap(), "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let config = MirrorConfig::from_file(&path).unwrap();
    assert_eq!(config.workspace_root, dir.path());
    assert_eq!(config.debounce_window_ms, 500);

    // Refuses to clobber without --force
    let output = mirrorsync()
        .args(["init-config", path.to_str().unwrap(), "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_ledger_prints_current_records() {
    let dir = TempDir::new().unwrap();
    let config = MirrorConfig::new(dir.path());
    let ledger = SqlLedger::open(config.ledger_path()).unwrap();
    ledger
        .record(&SyncRecord::new("a.txt", "h1", 1.0, "s1", 5))
        .unwrap();
    ledger
        .record(&SyncRecord::new("a.txt", "h2", 2.0, "s1", 6))
        .unwrap();
    drop(ledger);

    let output = mirrorsync()
        .args(["ledger", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let records: Vec<SyncRecord> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content_hash, "h2");

    let output = mirrorsync()
        .args(["ledger", "--history", "10", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    let history: Vec<SyncRecord> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn test_ledger_without_database_fails() {
    let dir = TempDir::new().unwrap();
    let output = mirrorsync()
        .args(["ledger", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No ledger"));
}
