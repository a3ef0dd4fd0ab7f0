//! End-to-end CLI tests, run against the `dummy` adapter so no network
//! backend is required (§8, "a `tests/cli.rs` integration test ... that runs
//! the whole binary end to end against the dummy adapter").

use std::{fs, process::Command};

use assert_cmd::prelude::*;
use serde_json::Value;

fn cmd() -> Command {
    Command::cargo_bin("llm-load-profiler").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_missing_config_exits_one() {
    cmd()
        .arg("--config")
        .arg("tests/fixtures/does-not-exist.yaml")
        .assert()
        .code(1);
}

#[test]
fn test_dummy_run_writes_summary() {
    let out_dir = "tests/fixtures/out";
    let out_file = format!("{out_dir}/result_2_1.json");
    let _ = fs::remove_file(&out_file);

    cmd()
        .arg("--config")
        .arg("tests/fixtures/config.yaml")
        .arg("--log-level")
        .arg("warn")
        .assert()
        .success();

    let contents = fs::read_to_string(&out_file).expect("output file should have been written");
    let doc: Value = serde_json::from_str(&contents).unwrap();

    assert!(doc.get("config").is_some());
    assert!(doc["results"].as_array().unwrap().len() >= 1);
    assert_eq!(doc["summary"]["total_failures"], 0);
    assert_eq!(doc["summary"]["failure_rate"], 0.0);

    let _ = fs::remove_file(&out_file);
}
