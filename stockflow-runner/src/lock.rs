//! Cross-process claim on a LogicalRun.
//!
//! Every orchestrator sharing a ledger takes an advisory exclusive lock on
//! `{ledger_dir}/locks/{SYMBOL}@{run_date}.lock` for the lifetime of an
//! attempt. The OS drops the lock when the holder exits, so a crashed
//! process never leaves a run claimed. Lock files are left in place.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use stockflow_core::domain::LogicalRun;

use crate::error::OrchestratorError;

const LOCK_DIR: &str = "locks";

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Lock file for `run` next to the ledger at `ledger_path`.
    pub fn path_for(ledger_path: &Path, run: &LogicalRun) -> PathBuf {
        let dir = match ledger_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(LOCK_DIR),
            _ => PathBuf::from(LOCK_DIR),
        };
        dir.join(format!("{}@{}.lock", run.symbol, run.run_date))
    }

    /// Take the lock without blocking. A lock held elsewhere is
    /// `AlreadyRunning`.
    pub fn acquire(ledger_path: &Path, run: &LogicalRun) -> Result<Self, OrchestratorError> {
        let path = Self::path_for(ledger_path, run);
        let lock_err = |source: io::Error| OrchestratorError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(run = %run, lock = %path.display(), "run lock acquired");
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => Err(OrchestratorError::AlreadyRunning(run.clone())),
            Err(e) => Err(lock_err(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
