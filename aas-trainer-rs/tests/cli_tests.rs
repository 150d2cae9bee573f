//! Integration tests for the aas CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use aas_trainer_rs::{CheckpointManager, ModelRole};
use candle_core::{Device, Var};
use candle_nn::VarMap;

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("aas").expect("Failed to find aas binary");
    cmd.args(args);
    cmd
}

fn write_config(dir: &Path, content: &str) -> String {
    let path = dir.join("aas.yaml");
    fs::write(&path, content).expect("Failed to write test config");
    path.to_str().unwrap().to_string()
}

fn valid_config_yaml() -> &'static str {
    r#"
output_dir: "./runs/aas"
batch_size: 8
optim:
  learning_rate: 0.0001
  beta1: 0.9
  beta2: 0.999
  amsgrad: true
controller:
  gamma: 1.0
  lambda_k: 0.001
schedule:
  max_iter: 2000
  log_iter: 10
  save_iter: 100
  allow_asr_update_iter: 500
"#
}

#[test]
fn test_validate_command_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), valid_config_yaml());

    run_cli(&["validate", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("0..2000"));
}

#[test]
fn test_validate_command_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "output_dir: ./out\nschedule:\n  max_iter: 10\n  start_iter: 10\n",
    );

    run_cli(&["validate", &config])
        .assert()
        .failure()
        .stderr(predicate::str::contains("start_iter"));
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/aas.yaml"]).assert().failure();
}

#[test]
fn test_init_writes_loadable_config() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("debug.yaml");
    let output_str = output.to_str().unwrap();

    run_cli(&["init", output_str, "--preset", "debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    run_cli(&["validate", output_str]).assert().success();
}

#[test]
fn test_init_unknown_preset() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("x.yaml");

    run_cli(&["init", output.to_str().unwrap(), "--preset", "huge"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset"));
    assert!(!output.exists());
}

#[test]
fn test_resume_point_prints_best_iteration() {
    let dir = TempDir::new().unwrap();
    {
        let vars = VarMap::new();
        let var = Var::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap();
        vars.data().lock().unwrap().insert("w".to_string(), var);

        let mut manager = CheckpointManager::open(dir.path()).unwrap();
        manager.save_latest(ModelRole::Generator, 300, &vars).unwrap();
        manager.promote_to_best(ModelRole::Generator, 300, 0.5).unwrap();
    }
    let dir_str = dir.path().to_str().unwrap();

    run_cli(&["resume-point", dir_str])
        .assert()
        .success()
        .stdout(predicate::str::diff("300\n"));

    run_cli(&["resume-point", dir_str, "--start-iter", "400"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("startup error"));
}

#[test]
fn test_resume_point_empty_directory_fails() {
    let dir = TempDir::new().unwrap();

    run_cli(&["resume-point", dir.path().to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no checkpoint manifest"));
}

#[test]
fn test_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("resume-point"));
}
