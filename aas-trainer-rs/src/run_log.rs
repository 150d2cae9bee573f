//! Append-only run log.
//!
//! Each line goes to `tracing` and to `log.txt` in the run directory. The
//! file is flushed after every line. I/O failures are reported with
//! `tracing::warn!` and otherwise ignored: losing a log line never corrupts
//! model state.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Best-effort line log for one training run.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RunLog {
    /// Open `path` for appending. If it cannot be opened, lines still reach
    /// `tracing`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let writer = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                tracing::warn!("Cannot open run log {}: {e}", path.display());
                None
            }
        };
        Self { path, writer }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether lines are reaching the file.
    pub fn is_writing(&self) -> bool {
        self.writer.is_some()
    }

    /// Append one line and flush.
    pub fn line(&mut self, line: &str) {
        tracing::info!("{line}");
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            tracing::warn!("Failed to write run log {}: {e}", self.path.display());
        }
    }
}
