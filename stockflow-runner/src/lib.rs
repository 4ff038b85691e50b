//! StockFlow Runner — orchestration of the daily price pipeline.
//!
//! This crate builds on `stockflow-core` to provide:
//! - The linear task graph and per-node execution records
//! - Bounded per-node retry with fixed or exponential backoff
//! - Per-LogicalRun mutual exclusion across processes, cancellation, and
//!   resume-at-failed-node
//! - JSONL run ledger for status and resume
//! - Daily schedule with catchup disabled
//! - TOML pipeline configuration

pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod retry;
pub mod run;
pub mod schedule;
pub mod task;

pub use config::{ConfigError, PipelineConfig};
pub use error::OrchestratorError;
pub use ledger::{LedgerError, RunLedger};
pub use lock::RunLock;
pub use orchestrator::{Orchestrator, Stages};
pub use retry::{run_with_retry, Backoff, RetryPolicies, RetryPolicy};
pub use run::{PipelineRun, RunArtifacts, RunState, Trigger};
pub use schedule::DailySchedule;
pub use task::{TaskError, TaskId, TaskRun, TaskState, PIPELINE};
