// src/model/event.rs
//! Append-only run events

use crate::model::ids::RunId;
use crate::model::run::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStarted,
    TurnStarted,
    RunnerOutput,
    ToolInvoked,
    ToolResult,
    CheckpointWritten,
    Progress,
    RunStopping,
    RunCompleted,
    RunFailed,
    RunCancelled,
    RunTimeout,
    RunOrphaned,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::RunCreated,
        EventKind::RunStarted,
        EventKind::TurnStarted,
        EventKind::RunnerOutput,
        EventKind::ToolInvoked,
        EventKind::ToolResult,
        EventKind::CheckpointWritten,
        EventKind::Progress,
        EventKind::RunStopping,
        EventKind::RunCompleted,
        EventKind::RunFailed,
        EventKind::RunCancelled,
        EventKind::RunTimeout,
        EventKind::RunOrphaned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunCreated => "run_created",
            EventKind::RunStarted => "run_started",
            EventKind::TurnStarted => "turn_started",
            EventKind::RunnerOutput => "runner_output",
            EventKind::ToolInvoked => "tool_invoked",
            EventKind::ToolResult => "tool_result",
            EventKind::CheckpointWritten => "checkpoint_written",
            EventKind::Progress => "progress",
            EventKind::RunStopping => "run_stopping",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunFailed => "run_failed",
            EventKind::RunCancelled => "run_cancelled",
            EventKind::RunTimeout => "run_timeout",
            EventKind::RunOrphaned => "run_orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }

    /// The run status a terminal event announces
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            EventKind::RunCompleted => Some(RunStatus::Completed),
            EventKind::RunFailed => Some(RunStatus::Failed),
            EventKind::RunCancelled => Some(RunStatus::Cancelled),
            EventKind::RunTimeout => Some(RunStatus::Timeout),
            EventKind::RunOrphaned => Some(RunStatus::Orphaned),
            _ => None,
        }
    }

    /// Terminal event announcing `status`
    pub fn for_terminal_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Completed => Some(EventKind::RunCompleted),
            RunStatus::Failed => Some(EventKind::RunFailed),
            RunStatus::Cancelled => Some(EventKind::RunCancelled),
            RunStatus::Timeout => Some(EventKind::RunTimeout),
            RunStatus::Orphaned => Some(EventKind::RunOrphaned),
            _ => None,
        }
    }
}

/// Event waiting to be assigned a sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,

    /// Gap-free, starting at 1 within the run
    pub seq: u64,

    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds_match_statuses() {
        for kind in EventKind::ALL {
            if let Some(status) = kind.terminal_status() {
                assert!(status.is_terminal());
                assert_eq!(EventKind::for_terminal_status(status), Some(kind));
            }
        }
        assert!(!EventKind::RunStopping.is_terminal());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
