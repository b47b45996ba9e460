//! Integration tests for the pummel CLI.
//!
//! These drive the compiled binary end-to-end with short, tightly
//! budgeted runs.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the pummel binary.
fn pummel() -> Command {
    Command::cargo_bin("pummel").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    pummel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn test_list_shows_registered_stressors() {
    pummel()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pipe"))
        .stdout(predicate::str::contains("flock"))
        .stdout(predicate::str::contains("mlock"));
}

#[test]
fn test_unknown_stressor_fails() {
    pummel()
        .args(["run", "frobnicate", "-t", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stressor"));
}

#[test]
fn test_zero_workers_rejected() {
    pummel()
        .args(["run", "pipe", "--workers", "0", "-t", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker count"));
}

#[test]
fn test_pipe_run_with_op_budget() {
    pummel()
        .args(["run", "pipe", "--ops", "1000", "-t", "10"])
        .assert()
        .success();
}

#[test]
fn test_timeout_bounds_the_run() {
    // A one-second budget must end a run with no op budget.
    pummel()
        .args(["run", "pipe", "-t", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

#[test]
fn test_flock_run_writes_metrics_report() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("report.json");

    pummel()
        .args([
            "run",
            "flock",
            "--ops",
            "500",
            "-t",
            "10",
            "--metrics-out",
            report_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let text = std::fs::read_to_string(&report_path).expect("report not written");
    let report: serde_json::Value = serde_json::from_str(&text).expect("invalid JSON");

    assert_eq!(report["stressor"], "flock");
    assert_eq!(report["status"], "success");
    assert!(report["total_bogo_ops"].as_u64().unwrap() >= 500);

    let metrics = report["instances"][0]["metrics"]
        .as_array()
        .expect("metrics missing");
    assert!(
        metrics
            .iter()
            .any(|m| m["label"].as_str().unwrap().contains("flock lock"))
    );
}

#[test]
fn test_multiple_workers_each_make_progress() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("report.json");

    pummel()
        .args([
            "run",
            "pipe",
            "--workers",
            "2",
            "--ops",
            "500",
            "-t",
            "10",
            "--metrics-out",
            report_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let text = std::fs::read_to_string(&report_path).expect("report not written");
    let report: serde_json::Value = serde_json::from_str(&text).expect("invalid JSON");

    let instances = report["instances"].as_array().expect("instances missing");
    assert_eq!(instances.len(), 2);
    for instance in instances {
        assert!(instance["bogo_ops"].as_u64().unwrap() >= 500);
    }
}
