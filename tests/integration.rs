//! Integration tests for the entangle CLI.
//!
//! These run the built-in example graphs end-to-end through the binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the entangle binary with a clean environment.
fn entangle() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("entangle").unwrap();
    for var in [
        "ENTANGLE_LOG",
        "ENTANGLE_LOG_FILE",
        "ENTANGLE_TIMEOUT_MS",
        "ENTANGLE_POLL_INTERVAL_MS",
        "ENTANGLE_CPUS",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help() {
    entangle()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_run_add() {
    entangle()
        .args(["run", "add"])
        .assert()
        .success()
        .stdout(predicate::eq("5\n"));
}

#[test]
fn test_run_add_with_report() {
    entangle()
        .args(["run", "add", "--report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5\n"))
        .stdout(predicate::str::contains(r#""spawned":2"#))
        .stdout(predicate::str::contains(r#""joined":2"#));
}

#[test]
fn test_run_add_on_threads() {
    entangle()
        .args(["run", "add", "--executor", "thread"])
        .assert()
        .success()
        .stdout(predicate::eq("5\n"));
}

#[test]
fn test_fan_out_same_result_with_shared_memory() {
    entangle()
        .args(["run", "fan-out", "4"])
        .assert()
        .success()
        .stdout(predicate::eq("30\n"));

    entangle()
        .args(["run", "fan-out", "4", "--shared-memory"])
        .assert()
        .success()
        .stdout(predicate::eq("30\n"));
}

#[test]
fn test_fan_out_under_cpu_budget() {
    entangle()
        .args(["run", "fan-out", "5", "--cpus", "2", "--report"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("55\n"))
        .stdout(predicate::str::contains(r#""spawned":5"#));
}

#[test]
fn test_branch_scenarios() {
    entangle()
        .args(["run", "branch", "emit"])
        .assert()
        .success()
        .stdout(predicate::str::contains("X: emit!"));

    entangle()
        .args(["run", "branch", "HELLO"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Y: HELLO!"));
}

#[test]
fn test_stall_times_out() {
    entangle()
        .args(["run", "stall", "--timeout-ms", "200", "--poll-interval-ms", "10"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Timed out"))
        .stderr(predicate::str::contains("'add'"));
}

#[test]
fn test_stall_finishes_without_timeout() {
    entangle()
        .args(["run", "stall", "--stall-ms", "50"])
        .assert()
        .success()
        .stdout(predicate::eq("1\n"));
}

#[test]
fn test_log_file_written() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("entangle.log");

    entangle()
        .args(["run", "add", "-vv", "--log-format", "json", "--log-file"])
        .arg(&log_path)
        .assert()
        .success()
        .stdout(predicate::eq("5\n"));

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("Launched worker"), "log was: {}", contents);
}

#[test]
fn test_unknown_scenario_fails() {
    entangle()
        .args(["run", "nonsense"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
