use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;

fn events(stdout: &[u8]) -> Vec<String> {
    let value: Value = serde_json::from_slice(stdout).expect("stdout should contain valid json");
    value["events"]
        .as_array()
        .expect("events should be an array")
        .iter()
        .map(|e| e.as_str().expect("events are strings").to_owned())
        .collect()
}

#[test]
fn scenario_emits_stable_json_contract() {
    let output = cargo_bin_cmd!("mapkit-sched")
        .arg("scenario")
        .arg("quota-yield")
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: Value = serde_json::from_slice(&output).expect("stdout should contain valid json");
    assert_eq!(value["scenario"], "quota-yield");

    let events = events(&output);
    assert_eq!(events.len(), 7);
    assert_eq!(events[1], "timer");
    assert_eq!(events[6], "task-done");
}

#[test]
fn scenario_sequence_continuation_order() {
    let output = cargo_bin_cmd!("mapkit-sched")
        .args(["scenario", "sequence-continuation"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let order: Vec<String> = events(&output)
        .into_iter()
        .filter(|e| !e.ends_with("-done") || e == "sequence-done")
        .collect();
    assert_eq!(
        order,
        vec!["stage1-exec", "stage2-exec", "sequence-done", "independent-exec"]
    );
}

#[test]
fn scenario_rejects_unknown_name() {
    cargo_bin_cmd!("mapkit-sched")
        .args(["scenario", "thundering-herd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn verbose_scenario_logs_to_stderr_only() {
    cargo_bin_cmd!("mapkit-sched")
        .args(["-v", "scenario", "tick-budget"])
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("{"))
        .stderr(predicate::str::contains("task yielded"));
}

#[test]
fn config_reads_environment() {
    let output = cargo_bin_cmd!("mapkit-sched")
        .arg("config")
        .env("MAPKIT_SCHED_TICK_BUDGET_MS", "16")
        .env("MAPKIT_SCHED_MAX_LANES", "4")
        .env_remove("MAPKIT_SCHED_TIME_QUOTA_MS")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: Value = serde_json::from_slice(&output).expect("stdout should contain valid json");
    assert_eq!(value["tick_budget_ms"], 16);
    assert_eq!(value["max_priority_lanes"], 4);
    assert!(value["default_time_quota_ms"].is_null());
}

#[test]
fn config_reads_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let path = temp.path().join("scheduler.conf");
    std::fs::write(&path, "tick_budget_ms = 8\ntime_quota_ms = 2\n").expect("config should be written");

    cargo_bin_cmd!("mapkit-sched")
        .arg("config")
        .arg("--file")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tick_budget_ms\": 8"))
        .stdout(predicate::str::contains("\"default_time_quota_ms\": 2"));
}

#[test]
fn config_fails_for_invalid_environment() {
    cargo_bin_cmd!("mapkit-sched")
        .arg("config")
        .env("MAPKIT_SCHED_MAX_LANES", "many")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid scheduler environment"));
}

#[test]
fn config_fails_for_missing_file() {
    cargo_bin_cmd!("mapkit-sched")
        .args(["config", "--file", "/definitely/not/here.conf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("mapkit-sched")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
