//! Checkpoint persistence with latest/best retention.
//!
//! Every model role keeps at most one `latest` and one `best` snapshot on
//! disk. Snapshots are safetensors files named
//! `<role>_<kind>_<iteration>.safetensors`; a `manifest.json` next to them
//! records role, kind and iteration of every retained file, so resume never
//! has to parse file names.
//!
//! A new snapshot is written to a temporary sibling, synced and renamed into
//! place. The manifest follows the same path. The superseded file is removed
//! last; if that fails the new file and its manifest entry are rolled back,
//! so the directory never holds two files of one kind for a role and never
//! holds none. Snapshot and temporary files left behind by a crash before
//! the manifest write are removed the next time the directory is opened.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AasError, Result};
use crate::network::{load_vars, ModelRole};

/// Manifest file name inside a checkpoint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

/// Retention class of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Most recent periodic save.
    Latest,
    /// Snapshot at the best validation word error rate so far.
    Best,
}

impl CheckpointKind {
    /// Lowercase name used in file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Latest => "latest",
            CheckpointKind::Best => "best",
        }
    }
}

/// One retained snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Model the snapshot belongs to.
    pub role: ModelRole,
    /// Retention class.
    pub kind: CheckpointKind,
    /// Iteration at which the parameters were captured.
    pub iteration: u64,
    /// File name relative to the checkpoint directory.
    pub file: String,
    /// Time the file was committed.
    pub saved_at: DateTime<Utc>,
    /// Validation word error rate that earned a best snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_error_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    records: Vec<CheckpointRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            records: Vec::new(),
        }
    }
}

/// Owns a checkpoint directory and its manifest.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    manifest: Manifest,
}

impl CheckpointManager {
    /// Open `dir` for writing, creating it if needed. An existing manifest
    /// is loaded; otherwise the manager starts empty. Snapshot files the
    /// manifest does not list, and leftover `.tmp` files, are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the manifest
    /// is unreadable.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            AasError::checkpoint(format!("failed to create {}: {e}", dir.display()))
        })?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            read_manifest(&manifest_path)?
        } else {
            Manifest::default()
        };

        let manager = Self { dir, manifest };
        manager.remove_orphans()?;
        Ok(manager)
    }

    /// Open an existing checkpoint directory for resuming.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::StartupFatal`] if the directory or its manifest
    /// does not exist, or the manifest holds no record.
    pub fn open_existing(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(AasError::startup(format!(
                "no checkpoint manifest in {}",
                dir.display()
            )));
        }
        let manifest = read_manifest(&manifest_path)?;
        if manifest.records.is_empty() {
            return Err(AasError::startup(format!(
                "checkpoint manifest in {} is empty",
                dir.display()
            )));
        }
        Ok(Self { dir, manifest })
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All retained records.
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.manifest.records
    }

    /// Retained record of one role and kind.
    pub fn record(&self, role: ModelRole, kind: CheckpointKind) -> Option<&CheckpointRecord> {
        self.manifest
            .records
            .iter()
            .find(|r| r.role == role && r.kind == kind)
    }

    /// Path of a record's file.
    pub fn path_of(&self, record: &CheckpointRecord) -> PathBuf {
        self.dir.join(&record.file)
    }

    /// Persist `vars` as the latest snapshot of `role`, replacing the
    /// previous latest.
    ///
    /// # Errors
    ///
    /// Returns an error if writing, syncing or retiring the old file fails.
    /// The previous latest snapshot is intact in that case.
    pub fn save_latest(
        &mut self,
        role: ModelRole,
        iteration: u64,
        vars: &VarMap,
    ) -> Result<CheckpointRecord> {
        let file = file_name(role, CheckpointKind::Latest, iteration);
        let target = self.dir.join(&file);
        let tmp = tmp_path(&target);

        vars.save(&tmp).map_err(|e| {
            AasError::checkpoint(format!("failed to write {}: {e}", tmp.display()))
        })?;
        sync_and_rename(&tmp, &target)?;

        let record = CheckpointRecord {
            role,
            kind: CheckpointKind::Latest,
            iteration,
            file,
            saved_at: Utc::now(),
            word_error_rate: None,
        };
        self.commit(record.clone())?;
        tracing::debug!("Saved {} latest checkpoint at iteration {}", role, iteration);
        Ok(record)
    }

    /// Copy the latest snapshot of `role` to its best slot, replacing the
    /// previous best. `word_error_rate` is stored with the record.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::Checkpoint`] if the latest snapshot of `role` was
    /// not taken at `iteration`, or if copying fails.
    pub fn promote_to_best(
        &mut self,
        role: ModelRole,
        iteration: u64,
        word_error_rate: f64,
    ) -> Result<CheckpointRecord> {
        let latest = self
            .record(role, CheckpointKind::Latest)
            .filter(|r| r.iteration == iteration)
            .cloned()
            .ok_or_else(|| {
                AasError::checkpoint(format!(
                    "no latest {role} checkpoint at iteration {iteration} to promote"
                ))
            })?;

        let file = file_name(role, CheckpointKind::Best, iteration);
        let target = self.dir.join(&file);
        let tmp = tmp_path(&target);

        fs::copy(self.path_of(&latest), &tmp).map_err(|e| {
            AasError::checkpoint(format!("failed to copy {}: {e}", latest.file))
        })?;
        sync_and_rename(&tmp, &target)?;

        let record = CheckpointRecord {
            role,
            kind: CheckpointKind::Best,
            iteration,
            file,
            saved_at: Utc::now(),
            word_error_rate: Some(word_error_rate),
        };
        self.commit(record.clone())?;
        tracing::info!("Promoted {} checkpoint at iteration {} to best", role, iteration);
        Ok(record)
    }

    /// Restore `vars` from the latest snapshot of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::Checkpoint`] if no such snapshot exists or it does
    /// not match `vars`.
    pub fn load_latest(&self, role: ModelRole, vars: &VarMap, device: &Device) -> Result<u64> {
        let record = self
            .record(role, CheckpointKind::Latest)
            .ok_or_else(|| AasError::checkpoint(format!("no latest {role} checkpoint")))?;
        load_vars(vars, &self.path_of(record), device)?;
        Ok(record.iteration)
    }

    /// Restore `vars` from the best snapshot of `role` taken at `iteration`.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::Checkpoint`] if no such snapshot exists or it does
    /// not match `vars`.
    pub fn load_best(
        &self,
        role: ModelRole,
        iteration: u64,
        vars: &VarMap,
        device: &Device,
    ) -> Result<()> {
        let record = self
            .best_at(role, iteration)
            .ok_or_else(|| {
                AasError::checkpoint(format!("no best {role} checkpoint at iteration {iteration}"))
            })?;
        load_vars(vars, &self.path_of(record), device)
    }

    /// Word error rate stored with the best snapshot of `role`.
    pub fn best_word_error_rate(&self, role: ModelRole) -> Option<f64> {
        self.record(role, CheckpointKind::Best)
            .and_then(|r| r.word_error_rate)
    }

    /// Best record of `role` at `iteration`, if retained.
    pub fn best_at(&self, role: ModelRole, iteration: u64) -> Option<&CheckpointRecord> {
        self.manifest.records.iter().find(|r| {
            r.role == role && r.kind == CheckpointKind::Best && r.iteration == iteration
        })
    }

    /// Iteration a resumed run starts from.
    ///
    /// `requested == 0` infers the maximum iteration among generator best
    /// snapshots. Any other value must match a generator best snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::StartupFatal`] if nothing can be inferred, the
    /// inferred iteration is 0, or the requested iteration has no snapshot.
    pub fn resume_iteration(&self, requested: u64) -> Result<u64> {
        if requested > 0 {
            return match self.best_at(ModelRole::Generator, requested) {
                Some(_) => Ok(requested),
                None => Err(AasError::startup(format!(
                    "no best generator checkpoint at requested iteration {requested} in {}",
                    self.dir.display()
                ))),
            };
        }

        let inferred = self
            .manifest
            .records
            .iter()
            .filter(|r| r.role == ModelRole::Generator && r.kind == CheckpointKind::Best)
            .map(|r| r.iteration)
            .max()
            .ok_or_else(|| {
                AasError::startup(format!(
                    "no best generator checkpoint in {}",
                    self.dir.display()
                ))
            })?;

        if inferred == 0 {
            return Err(AasError::startup(
                "inferred resume iteration is 0; refusing to start from an untrained state",
            ));
        }
        Ok(inferred)
    }

    /// Replace the record of the same role and kind, persist the manifest,
    /// then remove the superseded file.
    fn commit(&mut self, record: CheckpointRecord) -> Result<()> {
        let new_path = self.path_of(&record);
        let position = self
            .manifest
            .records
            .iter()
            .position(|r| r.role == record.role && r.kind == record.kind);

        let previous = match position {
            Some(i) => Some(std::mem::replace(&mut self.manifest.records[i], record.clone())),
            None => {
                self.manifest.records.push(record.clone());
                None
            }
        };

        if let Err(e) = self.write_manifest() {
            self.restore(position, previous.clone());
            if previous.as_ref().map(|p| &p.file) != Some(&record.file) {
                let _ = fs::remove_file(&new_path);
            }
            return Err(e);
        }

        if let Some(old) = previous.as_ref().filter(|p| p.file != record.file) {
            if let Err(e) = fs::remove_file(self.path_of(old)) {
                self.restore(position, previous.clone());
                let rewrite = self.write_manifest();
                let _ = fs::remove_file(&new_path);
                rewrite?;
                return Err(AasError::checkpoint(format!(
                    "failed to remove superseded {}: {e}",
                    old.file
                )));
            }
        }

        Ok(())
    }

    fn remove_orphans(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            AasError::checkpoint(format!("failed to list {}: {e}", self.dir.display()))
        })?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let orphan = name.ends_with(".tmp")
                || (is_snapshot_name(&name)
                    && !self.manifest.records.iter().any(|r| r.file == name));
            if orphan {
                tracing::warn!("Removing orphaned checkpoint file {}", name);
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!("Failed to remove {}: {}", name, e);
                }
            }
        }
        Ok(())
    }

    fn restore(&mut self, position: Option<usize>, previous: Option<CheckpointRecord>) {
        match (position, previous) {
            (Some(i), Some(old)) => self.manifest.records[i] = old,
            _ => {
                self.manifest.records.pop();
            }
        }
    }

    fn write_manifest(&self) -> Result<()> {
        let target = self.dir.join(MANIFEST_FILE);
        let tmp = tmp_path(&target);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &self.manifest)?;
            writer.flush()?;
        }
        sync_and_rename(&tmp, &target)
    }
}

/// File name of a snapshot.
pub fn file_name(role: ModelRole, kind: CheckpointKind, iteration: u64) -> String {
    format!("{}_{}_{}.safetensors", role.as_str(), kind.as_str(), iteration)
}

fn is_snapshot_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".safetensors") else {
        return false;
    };
    ModelRole::ALL.iter().any(|role| {
        [CheckpointKind::Latest, CheckpointKind::Best].iter().any(|kind| {
            stem.strip_prefix(&format!("{}_{}_", role.as_str(), kind.as_str()))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
    })
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn sync_and_rename(tmp: &Path, target: &Path) -> Result<()> {
    let synced = File::open(tmp).and_then(|f| f.sync_all());
    if let Err(e) = synced.and_then(|_| fs::rename(tmp, target)) {
        let _ = fs::remove_file(tmp);
        return Err(AasError::checkpoint(format!(
            "failed to commit {}: {e}",
            target.display()
        )));
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let file = File::open(path)?;
    let manifest: Manifest = serde_json::from_reader(BufReader::new(file))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(AasError::checkpoint(format!(
            "unsupported manifest version {} in {}",
            manifest.version,
            path.display()
        )));
    }
    Ok(manifest)
}
