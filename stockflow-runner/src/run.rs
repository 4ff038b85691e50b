//! PipelineRun — orchestration state for one LogicalRun execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::domain::{LogicalRun, RawPayload, RowCount};
use stockflow_core::storage::ObjectKey;

use crate::task::{TaskError, TaskId, TaskRun, TaskState, PIPELINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_label())
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Resume,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Resume => "resume",
        })
    }
}

/// Typed outputs handed from node to node.
///
/// `fetched` only lives between `fetch` and `raw_store`: it is persisted so a
/// run that failed at `raw_store` resumes without calling the API again, and
/// dropped once the raw object exists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<RawPayload>,
    pub raw_key: Option<ObjectKey>,
    pub formatted_key: Option<ObjectKey>,
    pub rows_loaded: Option<RowCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run: LogicalRun,
    /// 1 for the first execution, incremented by each resume or re-trigger.
    pub execution: u32,
    pub trigger: Trigger,
    pub state: RunState,
    pub failed_task: Option<TaskId>,
    pub tasks: Vec<TaskRun>,
    pub artifacts: RunArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(run: LogicalRun, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            run,
            execution: 1,
            trigger,
            state: RunState::Queued,
            failed_task: None,
            tasks: PIPELINE.iter().copied().map(TaskRun::new).collect(),
            artifacts: RunArtifacts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, id: TaskId) -> &TaskRun {
        &self.tasks[id.index()]
    }

    /// First node that has not succeeded, for runs that can be resumed.
    pub fn resume_point(&self) -> Option<TaskId> {
        if !matches!(self.state, RunState::Failed | RunState::Cancelled | RunState::Running) {
            return None;
        }
        self.tasks
            .iter()
            .find(|t| t.state != TaskState::Succeeded)
            .map(|t| t.task)
    }

    /// Every node succeeded, whatever the recorded run state says.
    pub fn all_tasks_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Succeeded)
    }

    pub fn total_retries(&self) -> u32 {
        self.tasks.iter().map(TaskRun::retries).sum()
    }

    /// Last error of the failing node, if any.
    pub fn failure(&self) -> Option<(TaskId, &TaskError)> {
        let task = self.failed_task?;
        self.task(task).last_error.as_ref().map(|e| (task, e))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
