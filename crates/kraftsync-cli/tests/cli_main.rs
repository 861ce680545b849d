//! Command-line smoke tests.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn kraftsync() -> Command {
    let mut cmd = Command::cargo_bin("kraftsync").unwrap();
    for var in [
        "KRAFTSYNC_CONFIG",
        "KRAFTSYNC_SITE_ID",
        "KRAFTSYNC_SOURCE",
        "KRAFTSYNC_ACCESS_TOKEN",
        "KRAFTSYNC_LOG_JSON",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    kraftsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("discover"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_simulate_prints_json_lines() {
    let output = kraftsync()
        .args(["simulate", "--steps", "2", "--step-secs", "60"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 6);
    for line in lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value.get("device_id").is_some());
    }
}

#[test]
fn test_simulate_rejects_zero_step() {
    kraftsync()
        .args(["simulate", "--steps", "1", "--step-secs", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--step-secs"));
}

#[test]
fn test_discover_simulated_devices() {
    kraftsync()
        .args(["discover", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"role\":\"ev_charger\""))
        .stdout(predicate::str::contains("\"role\":\"water_heater\""));
}

#[test]
fn test_run_requires_site_id() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source = \"simulation\"\n\n[cloud]\nsite_id = \"\"").unwrap();

    kraftsync()
        .args(["run", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("site_id"));
}
