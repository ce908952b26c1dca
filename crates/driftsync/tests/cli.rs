//! Smoke tests for the `dsync` binary.

use std::path::Path;
use std::sync::Arc;

use assert_cmd::Command;
use driftsync_core::kv::SqliteStore;
use driftsync_core::local_store::LocalStore;
use driftsync_core::outbox::OutboxQueue;
use driftsync_core::record::Record;
use predicates::prelude::*;
use serde_json::json;

fn dsync() -> Command {
    let mut cmd = Command::cargo_bin("dsync").unwrap();
    cmd.env_remove("RUST_LOG").env_remove("DRIFTSYNC_CONFIG");
    cmd
}

fn seed(path: &Path) {
    let kv = Arc::new(SqliteStore::open(path).unwrap());
    let local = LocalStore::open(kv.clone()).unwrap();
    let outbox = OutboxQueue::open(kv).unwrap();
    for (id, owner) in [("a", "u1"), ("b", "u2")] {
        let mut record = Record::new(id, owner, json!({ "id": id }));
        record.last_updated = 10;
        local.upsert(record.clone()).unwrap();
        outbox.enqueue(record, owner, 10).unwrap();
    }
}

#[test]
fn status_lists_pending_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("sync.db");
    seed(&db);

    dsync()
        .args(["status", "--json", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\": 2"));
}

#[test]
fn records_filters_by_owner() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("sync.db");
    seed(&db);

    dsync()
        .args(["records", "--owner", "u2", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\":\"b\""))
        .stdout(predicate::str::contains("\"id\":\"a\"").not());
}

#[test]
fn config_default_prints_toml() {
    dsync()
        .args(["config", "--default"])
        .assert()
        .success()
        .stdout(predicate::str::contains("watchdog_ms = 30000"));
}

#[test]
fn simulate_prints_diagnostic_report() {
    dsync()
        .args(["--log-level", "warn", "simulate", "--records", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"snapshot\""));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    dsync()
        .arg("--config")
        .arg(dir.path().join("none.toml"))
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn unknown_fault_mode_is_rejected() {
    dsync()
        .args(["simulate", "--fail", "flaky"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown fault mode"));
}
