use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn botfleet() -> Command {
    let mut cmd = Command::cargo_bin("botfleet").expect("binary built");
    cmd.env_remove("BROKER_USERNAME")
        .env_remove("BROKER_PASSWORD")
        .env_remove("ARCHIVE_ACCESS_TOKEN")
        .arg("--color")
        .arg("never");
    cmd
}

const VALID: &str = r#"
[broker]
url = "ws://localhost:9001"

[[bots]]
name = "pmm-1"
credentials_profile = "master"
program = { type = "script", script = "pmm_simple.py" }
"#;

const STATUS: &str = r#"{
  "version": "1",
  "started_at": "2026-01-01T00:00:00Z",
  "pid": 4242,
  "updated_at": "2026-01-01T00:00:00Z",
  "broker": { "url": "ws://localhost:9001", "namespace": "botfleet", "connected": true },
  "bots": [
    {
      "name": "pmm-1",
      "state": "error",
      "desired": "running",
      "sandbox_id": "pmm-1-1",
      "last_heartbeat": null,
      "deploy_attempts": 2,
      "error": "sandbox exited with code 137",
      "archive_error": null,
      "cleanup_pending": true,
      "unresponsive": false
    }
  ],
  "feeds": []
}"#;

#[test]
fn check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("botfleet.toml");
    fs::write(&path, VALID).unwrap();

    botfleet()
        .args(["check", "config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration file is valid"))
        .stdout(predicate::str::contains("Broker credentials not set"));
}

#[test]
fn check_config_json_lists_bots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("botfleet.toml");
    fs::write(&path, VALID).unwrap();

    let output = botfleet()
        .args(["--json", "check", "config", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["command"], "check.config");
    assert_eq!(doc["valid"], true);
    assert_eq!(doc["bots"], serde_json::json!(["pmm-1"]));
}

#[test]
fn cli_returns_nonzero_on_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("botfleet.toml");
    fs::write(
        &path,
        "[broker]\nurl = \"ws://localhost:9001\"\n[orchestrator]\nstop_timeout_secs = 0\n",
    )
    .unwrap();

    botfleet()
        .args(["check", "config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid value for stop_timeout_secs"));
}

#[test]
fn check_config_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();

    botfleet()
        .args(["check", "config", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn status_without_file_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();

    botfleet()
        .args(["status", "--status-file"])
        .arg(dir.path().join("botfleet.status.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Status file not found"));
}

#[test]
fn status_renders_bots_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("botfleet.status.json");
    fs::write(&path, STATUS).unwrap();

    botfleet()
        .args(["status", "--status-file"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("pmm-1"))
        .stdout(predicate::str::contains("sandbox exited with code 137"))
        .stdout(predicate::str::contains("cleanup pending"))
        .stdout(predicate::str::contains("no active feeds"));
}

#[test]
fn status_json_passes_snapshot_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("botfleet.status.json");
    fs::write(&path, STATUS).unwrap();

    let output = botfleet()
        .args(["status", "--json", "--status-file"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["status"], "ok");
    assert_eq!(doc["snapshot"]["pid"], 4242);
    assert_eq!(doc["snapshot"]["bots"][0]["state"], "error");
}

#[test]
fn unknown_subcommand_fails() {
    botfleet()
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
