//! Pipeline nodes and their per-attempt execution records.
//!
//! ```text
//!  PENDING ──► RUNNING ──► SUCCEEDED
//!                │ ▲
//!                ▼ │
//!             RETRYING
//!                │
//!                ▼
//!             FAILED ──(resume)──► PENDING
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::PipelineError;

/// One node of the linear task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    GateCheck,
    Fetch,
    RawStore,
    Transform,
    Resolve,
    Load,
}

/// Execution order. Every run walks this list front to back.
pub const PIPELINE: [TaskId; 6] = [
    TaskId::GateCheck,
    TaskId::Fetch,
    TaskId::RawStore,
    TaskId::Transform,
    TaskId::Resolve,
    TaskId::Load,
];

impl TaskId {
    /// Position in [`PIPELINE`].
    pub const fn index(self) -> usize {
        match self {
            Self::GateCheck => 0,
            Self::Fetch => 1,
            Self::RawStore => 2,
            Self::Transform => 3,
            Self::Resolve => 4,
            Self::Load => 5,
        }
    }

    pub const fn as_label(self) -> &'static str {
        match self {
            Self::GateCheck => "gate_check",
            Self::Fetch => "fetch",
            Self::RawStore => "raw_store",
            Self::Transform => "transform",
            Self::Resolve => "resolve",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_label())
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PIPELINE
            .into_iter()
            .find(|t| t.as_label() == s)
            .ok_or_else(|| format!("unknown task '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    /// Between a retryable failure and the next attempt.
    Retrying,
    Succeeded,
    /// Retry budget exhausted or terminal error.
    Failed,
}

impl TaskState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Retrying),
            Self::Retrying => matches!(target, Self::Running),
            Self::Failed => matches!(target, Self::Pending),
            Self::Succeeded => false,
        }
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_label())
    }
}

/// Serializable snapshot of the error that ended an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&PipelineError> for TaskError {
    fn from(e: &PipelineError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Execution record of one node within a PipelineRun.
///
/// `attempts` accumulates across resumes so status output reflects every
/// call the node made for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    fn transition(&mut self, target: TaskState) {
        debug_assert!(
            self.state.can_transition_to(target),
            "{}: {} -> {target}",
            self.task,
            self.state
        );
        self.state = target;
    }

    pub(crate) fn begin_attempt(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.finished_at = None;
        self.attempts += 1;
        self.transition(TaskState::Running);
    }

    pub(crate) fn mark_retrying(&mut self, error: &PipelineError) {
        self.last_error = Some(error.into());
        self.transition(TaskState::Retrying);
    }

    pub(crate) fn succeed(&mut self) {
        self.finished_at = Some(Utc::now());
        self.transition(TaskState::Succeeded);
    }

    pub(crate) fn fail(&mut self, error: &PipelineError) {
        self.last_error = Some(error.into());
        self.finished_at = Some(Utc::now());
        self.transition(TaskState::Failed);
    }

    /// Return an unfinished node to `Pending` ahead of a resume. Covers
    /// nodes left `running` or `retrying` by a process that died.
    pub(crate) fn rearm(&mut self) {
        debug_assert_ne!(self.state, TaskState::Succeeded, "{} already succeeded", self.task);
        self.state = TaskState::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_order_matches_index() {
        for (i, task) in PIPELINE.iter().enumerate() {
            assert_eq!(task.index(), i);
            assert_eq!(task.as_label().parse::<TaskId>().unwrap(), *task);
        }
        assert!("deploy".parse::<TaskId>().is_err());
    }

    #[test]
    fn succeeded_is_absorbing() {
        for target in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Retrying,
            TaskState::Failed,
        ] {
            assert!(!TaskState::Succeeded.can_transition_to(target));
        }
    }

    #[test]
    fn retries_count_attempts_after_the_first() {
        let mut run = TaskRun::new(TaskId::RawStore);
        assert_eq!(run.retries(), 0);

        let err = PipelineError::StorageUnavailable("io".into());
        run.begin_attempt();
        run.mark_retrying(&err);
        run.begin_attempt();
        run.mark_retrying(&err);
        run.begin_attempt();
        run.succeed();

        assert_eq!(run.attempts, 3);
        assert_eq!(run.retries(), 2);
        assert_eq!(run.state, TaskState::Succeeded);
        assert_eq!(run.last_error.as_ref().unwrap().kind, "storage_unavailable");
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskId::GateCheck).unwrap();
        assert_eq!(json, "\"gate_check\"");
    }
}
