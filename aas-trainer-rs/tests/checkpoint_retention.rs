//! Integration tests for checkpoint retention and resume resolution.

use std::fs;
use std::path::Path;

use aas_trainer_rs::{AasError, CheckpointKind, CheckpointManager, ModelRole};
use candle_core::{Device, Var};
use candle_nn::VarMap;
use tempfile::TempDir;

fn vars_with(value: f32) -> VarMap {
    let vars = VarMap::new();
    let var = Var::from_vec(vec![value; 4], (2, 2), &Device::Cpu).unwrap();
    vars.data().lock().unwrap().insert("weight".to_string(), var);
    vars
}

fn files_for(dir: &Path, role: ModelRole) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(role.as_str()) && n.ends_with(".safetensors"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_promote_twice_keeps_one_best_and_one_latest() {
    let dir = TempDir::new().unwrap();
    let mut manager = CheckpointManager::open(dir.path()).unwrap();

    manager.save_latest(ModelRole::Generator, 100, &vars_with(1.0)).unwrap();
    manager.promote_to_best(ModelRole::Generator, 100, 0.5).unwrap();
    manager.save_latest(ModelRole::Generator, 200, &vars_with(2.0)).unwrap();
    manager.promote_to_best(ModelRole::Generator, 200, 0.5).unwrap();

    assert_eq!(
        files_for(dir.path(), ModelRole::Generator),
        vec![
            "generator_best_200.safetensors".to_string(),
            "generator_latest_200.safetensors".to_string(),
        ]
    );

    let best = manager.record(ModelRole::Generator, CheckpointKind::Best).unwrap();
    assert_eq!(best.iteration, 200);
    assert_eq!(manager.records().len(), 2);
}

#[test]
fn test_best_survives_newer_latest() {
    let dir = TempDir::new().unwrap();
    let mut manager = CheckpointManager::open(dir.path()).unwrap();

    manager.save_latest(ModelRole::Recognizer, 10, &vars_with(1.0)).unwrap();
    manager.promote_to_best(ModelRole::Recognizer, 10, 0.5).unwrap();
    manager.save_latest(ModelRole::Recognizer, 20, &vars_with(2.0)).unwrap();

    assert_eq!(
        files_for(dir.path(), ModelRole::Recognizer),
        vec![
            "recognizer_best_10.safetensors".to_string(),
            "recognizer_latest_20.safetensors".to_string(),
        ]
    );
}

#[test]
fn test_roles_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut manager = CheckpointManager::open(dir.path()).unwrap();

    manager.save_latest(ModelRole::Generator, 5, &vars_with(1.0)).unwrap();
    manager.save_latest(ModelRole::Recognizer, 5, &vars_with(1.0)).unwrap();
    manager.save_latest(ModelRole::Generator, 6, &vars_with(1.0)).unwrap();

    assert_eq!(files_for(dir.path(), ModelRole::Generator).len(), 1);
    assert_eq!(
        files_for(dir.path(), ModelRole::Recognizer),
        vec!["recognizer_latest_5.safetensors".to_string()]
    );
}

#[test]
fn test_resume_infers_max_best_iteration() {
    let dir = TempDir::new().unwrap();
    {
        let mut manager = CheckpointManager::open(dir.path()).unwrap();
        for iteration in [1000, 2000, 3000] {
            manager
                .save_latest(ModelRole::Generator, iteration, &vars_with(0.5))
                .unwrap();
        }
        manager.promote_to_best(ModelRole::Generator, 3000, 0.5).unwrap();
        manager.save_latest(ModelRole::Generator, 4000, &vars_with(0.5)).unwrap();
    }

    let manager = CheckpointManager::open_existing(dir.path()).unwrap();
    assert_eq!(manager.resume_iteration(0).unwrap(), 3000);
}

#[test]
fn test_resume_with_no_best_is_fatal() {
    let dir = TempDir::new().unwrap();
    {
        let mut manager = CheckpointManager::open(dir.path()).unwrap();
        manager.save_latest(ModelRole::Generator, 1000, &vars_with(0.5)).unwrap();
    }

    let manager = CheckpointManager::open_existing(dir.path()).unwrap();
    assert!(matches!(
        manager.resume_iteration(0),
        Err(AasError::StartupFatal(_))
    ));
}

#[test]
fn test_resume_from_empty_directory_is_fatal() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        CheckpointManager::open_existing(dir.path()),
        Err(AasError::StartupFatal(_))
    ));
}

#[test]
fn test_no_temporary_files_left_behind() {
    let dir = TempDir::new().unwrap();
    let mut manager = CheckpointManager::open(dir.path()).unwrap();
    manager.save_latest(ModelRole::Generator, 1, &vars_with(1.0)).unwrap();
    manager.promote_to_best(ModelRole::Generator, 1, 0.5).unwrap();

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
