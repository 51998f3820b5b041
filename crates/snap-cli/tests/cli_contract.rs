#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const CONFIG: &str = r#"
name: cli-demo
design:
  models: [model-a, model-b]
  items: { moral: [M01, M02] }
  paraphrases: [P1]
  system_prompts: [NEU]
  temperatures: [0.0, 0.7]
  contexts: { moral: [C0] }
  runs: 3
pricing:
  model_tiers: { model-a: budget }
  tier_costs: { budget: 0.5 }
  tokens_per_call: 200
cache:
  enabled: false
"#;

const STIMULI: &str = r#"
instruction: "Answer with a single number from 1 to 7."
system_prompts: { NEU: "You are a survey respondent." }
contexts: { C0: "" }
items:
  M01: { P1: "Lying is sometimes acceptable." }
  M02: { P1: "Rules should always be followed." }
"#;

fn write_fixture(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let config = dir.join("snap.yaml");
    let stimuli = dir.join("stimuli.yaml");
    fs::write(&config, CONFIG).unwrap();
    fs::write(&stimuli, STIMULI).unwrap();
    (config, stimuli)
}

fn snap() -> Command {
    let mut cmd = Command::cargo_bin("snap").expect("snap binary");
    cmd.env_remove("SNAP_API_KEY")
        .env_remove("OPENROUTER_API_KEY")
        .env_remove("SNAP_CONCURRENCY")
        .env_remove("SNAP_REQUESTS_PER_MINUTE")
        .env_remove("SNAP_BASE_URL");
    cmd
}

#[test]
fn help_lists_subcommands() {
    snap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("estimate"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn estimate_prints_cost_table() {
    let dir = tempdir().unwrap();
    let (config, _) = write_fixture(dir.path());

    snap()
        .args(["estimate", "--mode", "full", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Experiment cli-demo (full mode): 12 conditions, 24 calls, 24 remaining",
        ))
        // 12 calls * 200 tokens / 1000 * 0.5
        .stdout(predicate::str::contains("Total: $1.2000"))
        .stdout(predicate::str::contains("Unpriced models: model-b"));
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tempdir().unwrap();
    let (config, stimuli) = write_fixture(dir.path());
    let output = dir.path().join("results");

    snap()
        .args(["run", "--dry-run", "--models", "model-a", "--config"])
        .arg(&config)
        .arg("--stimuli")
        .arg(&stimuli)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("pilot mode"));
    assert!(!output.exists());
}

#[test]
fn missing_api_key_is_a_config_error() {
    let dir = tempdir().unwrap();
    let (config, stimuli) = write_fixture(dir.path());

    snap()
        .args(["run", "--config"])
        .arg(&config)
        .arg("--stimuli")
        .arg(&stimuli)
        .arg("--output")
        .arg(dir.path().join("results"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing API key"));
}

#[test]
fn unknown_model_is_rejected() {
    let dir = tempdir().unwrap();
    let (config, _) = write_fixture(dir.path());

    snap()
        .args(["estimate", "--models", "model-z", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown model"));
}

#[test]
fn status_of_missing_checkpoint_exits_3() {
    let dir = tempdir().unwrap();
    snap()
        .arg("status")
        .arg(dir.path().join("latest.json"))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("checkpoint not found"));
}
