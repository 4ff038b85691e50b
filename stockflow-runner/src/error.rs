use std::io;
use std::path::PathBuf;

use thiserror::Error;

use stockflow_core::domain::LogicalRun;
use stockflow_core::PipelineError;

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::run::RunState;

/// Errors that prevent the orchestrator from executing a run at all.
///
/// A run that executes and fails is not an error here: it comes back as a
/// `PipelineRun` in state `Failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0} already has an attempt in progress")]
    AlreadyRunning(LogicalRun),

    #[error("run lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no recorded execution for {0}")]
    UnknownRun(LogicalRun),

    #[error("{run} is {state}; only failed, cancelled or interrupted runs can be resumed")]
    NotResumable { run: LogicalRun, state: RunState },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("setup error: {0}")]
    Setup(#[from] PipelineError),
}
