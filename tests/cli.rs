use assert_cmd::prelude::*;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn bugtrail() -> Command {
    let mut cmd = Command::cargo_bin("bugtrail").unwrap();
    // Keep a developer's own configuration out of the runs.
    cmd.env("RUST_LOG", "warn")
        .env_remove("BUGTRAIL_CORRELATOR__DEDUP_WINDOW_MS");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let assert = cmd.assert().success();
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 output")
}

#[test]
fn correlate_emits_a_framed_timeline_as_json() {
    let input = Path::new("tests/fixtures/incident.json");
    assert!(input.exists(), "fixture missing");

    let stdout = stdout_of(bugtrail().args(["-o", "json", "correlate", input.to_str().unwrap()]));
    let value: Value = serde_json::from_str(&stdout).expect("valid json");

    let events = value["events"].as_array().unwrap();
    assert_eq!(events.first().unwrap()["kind"], "recording-start");
    assert_eq!(events.last().unwrap()["kind"], "recording-end");
    // The two console errors 30 ms apart collapse into one.
    let console: Vec<&Value> = events
        .iter()
        .filter(|event| event["kind"] == "console-error")
        .collect();
    assert_eq!(console.len(), 1);
    assert_eq!(console[0]["repeat_count"], 2);

    assert_eq!(value["summary"]["console_errors"], 2);
    assert_eq!(value["summary"]["network_failures"], 1);
    assert_eq!(value["summary"]["backend_errors"], 1);

    let issues = value["key_issues"].as_array().unwrap();
    assert_eq!(issues[0]["kind"], "backend-error");
    assert_eq!(issues[0]["is_root_cause"], true);
}

#[test]
fn dedup_window_override_keeps_repeats_apart() {
    let stdout = stdout_of(bugtrail().args([
        "-o",
        "json",
        "correlate",
        "tests/fixtures/incident.json",
        "--dedup-window-ms",
        "10",
    ]));
    let value: Value = serde_json::from_str(&stdout).unwrap();
    let console = value["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|event| event["kind"] == "console-error")
        .count();
    assert_eq!(console, 2);
}

#[test]
fn human_timeline_marks_the_root_cause() {
    let stdout = stdout_of(bugtrail().args(["correlate", "tests/fixtures/incident.json"]));
    assert!(stdout.contains("* +390ms backend-error"));
    assert!(stdout.contains("1 interactions"));
}

#[test]
fn correlate_can_save_to_a_file() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("timeline.yaml");
    bugtrail()
        .args(["-o", "yaml", "correlate", "tests/fixtures/incident.json", "--save"])
        .arg(&out)
        .assert()
        .success();
    let saved = std::fs::read_to_string(&out).unwrap();
    assert!(saved.contains("key_issues:"));
}

#[test]
fn config_file_and_environment_reach_the_commands() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bugtrail.yaml");
    std::fs::write(&path, "hub:\n  heartbeat_interval_ms: 5000\n").unwrap();

    let stdout = stdout_of(
        bugtrail()
            .env("BUGTRAIL_CORRELATOR__MESSAGE_CAP", "120")
            .arg("--config")
            .arg(&path)
            .args(["config", "get", "hub.heartbeat_interval_ms"]),
    );
    assert_eq!(stdout.trim(), "5000");

    let stdout = stdout_of(
        bugtrail()
            .env("BUGTRAIL_CORRELATOR__MESSAGE_CAP", "120")
            .arg("--config")
            .arg(&path)
            .args(["config", "get", "correlator.message_cap"]),
    );
    assert_eq!(stdout.trim(), "120");
}

#[test]
fn config_set_writes_only_the_edited_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bugtrail.yaml");

    bugtrail()
        .arg("--config")
        .arg(&path)
        .args(["config", "set", "correlator.dedup_window_ms", "250"])
        .assert()
        .failure();

    std::fs::write(&path, "logging:\n  level: info\n").unwrap();
    bugtrail()
        .arg("--config")
        .arg(&path)
        .args(["config", "set", "correlator.dedup_window_ms", "250"])
        .assert()
        .success();
    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("dedup_window_ms: 250"));
    assert!(!saved.contains("hub:"));

    bugtrail()
        .arg("--config")
        .arg(&path)
        .args(["config", "set", "correlator.dedup_window_ms", "90000"])
        .assert()
        .failure();
}

#[test]
fn missing_input_fails_cleanly() {
    bugtrail()
        .args(["correlate", "tests/fixtures/does-not-exist.json"])
        .assert()
        .failure();
}
