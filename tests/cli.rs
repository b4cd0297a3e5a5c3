use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DIAMOND: &str = r#"{
  "id": "diamond",
  "title": "Does remote work change commute emissions?",
  "steps": [
    {"id": "s1", "agent": "echo", "action": "collect"},
    {"id": "s2", "agent": "echo", "dependencies": ["s1"]},
    {"id": "s3", "agent": "echo", "dependencies": ["s2"]},
    {"id": "s4", "agent": "echo", "dependencies": ["s2"]},
    {"id": "s5", "agent": "echo", "dependencies": ["s3", "s4"]},
    {"id": "s6", "agent": "echo", "dependencies": ["s5"]}
  ]
}"#;

const CYCLIC: &str = r#"
id: cyclic
title: Loop
steps:
  - id: a
    agent: echo
    depends_on: [b]
  - id: b
    agent: echo
    depends_on: [a]
"#;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn veritas(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("veritas").unwrap();
    cmd.current_dir(dir.path()).env_remove("VERITAS_CONFIG");
    cmd
}

#[test]
fn validate_prints_groups() {
    let dir = TempDir::new().unwrap();
    let plan = write(dir.path(), "plan.json", DIAMOND);

    veritas(&dir)
        .arg("validate")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("6 steps in 5 groups"))
        .stdout(predicate::str::contains("3. s3, s4"));
}

#[test]
fn validate_rejects_cycles() {
    let dir = TempDir::new().unwrap();
    let plan = write(dir.path(), "plan.yaml", CYCLIC);

    veritas(&dir)
        .arg("validate")
        .arg(&plan)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cyclic dependency"));
}

#[test]
fn validate_flags_unregistered_agents() {
    let dir = TempDir::new().unwrap();
    let plan = write(
        dir.path(),
        "plan.json",
        r#"{"title": "t", "steps": [{"id": "a", "agent": "oracle"}]}"#,
    );

    veritas(&dir)
        .arg("validate")
        .arg(&plan)
        .assert()
        .failure()
        .stderr(predicate::str::contains("a -> oracle"));
}

#[test]
fn schema_prints_config_and_plan() {
    let dir = TempDir::new().unwrap();

    veritas(&dir)
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_workers"))
        .stdout(predicate::str::contains("failure_policy"));

    veritas(&dir)
        .args(["schema", "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dependencies"));
}

#[test]
fn dry_run_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let plan = write(dir.path(), "plan.json", DIAMOND);

    veritas(&dir)
        .arg("run")
        .arg(&plan)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Execution Plan"))
        .stdout(predicate::str::contains("s5 -> echo after s3, s4"));

    assert!(!dir.path().join("reports").exists());
    assert!(!dir.path().join(".veritas").exists());
}

#[test]
fn run_writes_summary_and_state() {
    let dir = TempDir::new().unwrap();
    let plan = write(dir.path(), "plan.json", DIAMOND);

    veritas(&dir)
        .arg("run")
        .arg(&plan)
        .args(["--report-dir", "out", "--json-events"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"plan_completed\""))
        .stderr(predicate::str::contains("6/6 steps succeeded"));

    let summary = fs::read_to_string(dir.path().join("out/diamond/summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["steps_executed"], 6);
    assert!(dir.path().join("out/diamond/summary.md").exists());

    let state = dir.path().join(".veritas/diamond");
    assert!(state.join("plan.json").exists());
    assert!(state.join("transitions.jsonl").exists());
}

#[test]
fn run_exits_nonzero_when_plan_fails() {
    let dir = TempDir::new().unwrap();
    let plan = write(
        dir.path(),
        "plan.json",
        r#"{"id": "broken", "title": "t", "steps": [
            {"id": "a", "agent": "oracle"},
            {"id": "b", "agent": "echo", "dependencies": ["a"]}
        ]}"#,
    );

    veritas(&dir)
        .arg("run")
        .arg(&plan)
        .args(["--no-persist", "--report-dir", "out"])
        .assert()
        .code(1);

    assert!(dir.path().join("out/broken/summary.json").exists());
    assert!(!dir.path().join(".veritas").exists());
}
