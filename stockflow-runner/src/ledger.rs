//! Run ledger — JSONL append-only log of PipelineRun snapshots.
//!
//! Every state change appends the full PipelineRun as one JSON line. The
//! newest snapshot per LogicalRun is its current state; older lines stay as
//! history. A torn final line from a crash is skipped on read.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::warn;

use stockflow_core::domain::LogicalRun;

use crate::run::PipelineRun;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O: {0}")]
    Io(#[from] io::Error),
    #[error("ledger encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

enum Backend {
    File(PathBuf),
    Memory(Vec<PipelineRun>),
}

pub struct RunLedger {
    // Serialises appends from concurrently executing runs.
    backend: Mutex<Backend>,
}

impl RunLedger {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: Mutex::new(Backend::File(path.into())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.lock() {
            Backend::File(path) => Some(path.clone()),
            Backend::Memory(_) => None,
        }
    }

    /// Append a snapshot.
    pub fn record(&self, run: &PipelineRun) -> Result<(), LedgerError> {
        match &mut *self.lock() {
            Backend::Memory(entries) => entries.push(run.clone()),
            Backend::File(path) => {
                let json = serde_json::to_string(run)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let torn = ends_mid_line(path)?;
                let mut file = OpenOptions::new().create(true).append(true).open(&*path)?;
                if torn {
                    writeln!(file)?;
                }
                writeln!(file, "{json}")?;
                file.flush()?;
            }
        }
        Ok(())
    }

    /// Every snapshot in append order. Malformed lines are skipped.
    pub fn snapshots(&self) -> Result<Vec<PipelineRun>, LedgerError> {
        match &*self.lock() {
            Backend::Memory(entries) => Ok(entries.clone()),
            Backend::File(path) => read_file(path),
        }
    }

    /// Newest snapshot per LogicalRun.
    pub fn latest_all(&self) -> Result<BTreeMap<LogicalRun, PipelineRun>, LedgerError> {
        let mut latest = BTreeMap::new();
        for snapshot in self.snapshots()? {
            latest.insert(snapshot.run.clone(), snapshot);
        }
        Ok(latest)
    }

    pub fn latest(&self, run: &LogicalRun) -> Result<Option<PipelineRun>, LedgerError> {
        Ok(self
            .snapshots()?
            .into_iter()
            .rev()
            .find(|snapshot| &snapshot.run == run))
    }

    /// Current state of the `n` most recent run dates for `symbol`, newest first.
    pub fn recent(&self, symbol: &str, n: usize) -> Result<Vec<PipelineRun>, LedgerError> {
        Ok(self
            .latest_all()?
            .into_values()
            .rev()
            .filter(|snapshot| snapshot.run.symbol == symbol)
            .take(n)
            .collect())
    }

    /// Latest run date with any recorded execution for `symbol`.
    pub fn last_run_date(&self, symbol: &str) -> Result<Option<NaiveDate>, LedgerError> {
        Ok(self
            .snapshots()?
            .iter()
            .filter(|snapshot| snapshot.run.symbol == symbol)
            .map(|snapshot| snapshot.run.run_date)
            .max())
    }
}

/// True when the file's last byte is not a newline (a crash mid-append).
fn ends_mid_line(path: &Path) -> io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_file(path: &Path) -> Result<Vec<PipelineRun>, LedgerError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PipelineRun>(&line) {
            Ok(entry) => entries.push(entry),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped malformed ledger lines");
    }
    Ok(entries)
}
