// src/model/task.rs
//! User-level unit of work

use crate::model::ids::{ProfileId, RunId, TaskId};
use crate::model::run::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Task status once its last live run ends in `run_status`
    pub fn after_run(run_status: RunStatus) -> Self {
        match run_status {
            RunStatus::Completed => TaskStatus::Completed,
            RunStatus::Cancelled => TaskStatus::Cancelled,
            s if s.is_terminal() => TaskStatus::Failed,
            _ => TaskStatus::InProgress,
        }
    }
}

/// A task; may have successive runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub profile_id: ProfileId,

    /// Prompt or structured payload handed to the runner
    pub prompt: String,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Most recent run for this task
    pub latest_run_id: Option<RunId>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        profile_id: impl Into<ProfileId>,
        prompt: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            profile_id: profile_id.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            created_at: at,
            updated_at: at,
            latest_run_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_after_run() {
        assert_eq!(TaskStatus::after_run(RunStatus::Completed), TaskStatus::Completed);
        assert_eq!(TaskStatus::after_run(RunStatus::Cancelled), TaskStatus::Cancelled);
        assert_eq!(TaskStatus::after_run(RunStatus::Timeout), TaskStatus::Failed);
        assert_eq!(TaskStatus::after_run(RunStatus::Orphaned), TaskStatus::Failed);
        assert_eq!(TaskStatus::after_run(RunStatus::Running), TaskStatus::InProgress);
    }
}
