// src/model/run.rs
//! Run entity and its state machine
//!
//! ```text
//! queued ─▶ starting ─▶ running ─▶ stopping ─▶ cancelled | timeout | failed
//!              │           │
//!              ▼           ├─▶ completed | failed
//!            failed        └─▶ orphaned
//! ```
//!
//! Terminal states are absorbing. Every repository applies transitions
//! through [`Run::apply_transition`], so the field invariants hold no matter
//! which storage engine is behind it.

use crate::model::ids::{ProfileId, RunId, TaskId};
use crate::model::profile::RunnerKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Orphaned,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Queued,
        RunStatus::Starting,
        RunStatus::Running,
        RunStatus::Stopping,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
        RunStatus::Timeout,
        RunStatus::Orphaned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
            RunStatus::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        RunStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Timeout
                | RunStatus::Orphaned
        )
    }

    /// Statuses that hold an admission slot and a process
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Starting | RunStatus::Running | RunStatus::Stopping
        )
    }

    /// Allowed edges of the run state machine
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::{
            Cancelled, Completed, Failed, Orphaned, Queued, Running, Starting, Stopping, Timeout,
        };

        matches!(
            (self, next),
            (Queued, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Orphaned)
                | (Running, Stopping)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Orphaned)
                | (Stopping, Cancelled)
                | (Stopping, Timeout)
                | (Stopping, Failed)
                | (Stopping, Orphaned)
        )
    }

    /// Outcome classification for a terminal status
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            RunStatus::Completed => Some(RunOutcome::Success),
            RunStatus::Failed => Some(RunOutcome::Failed),
            RunStatus::Cancelled => Some(RunOutcome::Cancelled),
            RunStatus::Timeout => Some(RunOutcome::Timeout),
            RunStatus::Orphaned => Some(RunOutcome::Orphaned),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Interactive,
    Batch,
    Continuation,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Interactive => "interactive",
            RunMode::Batch => "batch",
            RunMode::Continuation => "continuation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interactive" => Some(RunMode::Interactive),
            "batch" => Some(RunMode::Batch),
            "continuation" => Some(RunMode::Continuation),
            _ => None,
        }
    }
}

/// Final outcome classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
    Timeout,
    Orphaned,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Timeout => "timeout",
            RunOutcome::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunOutcome::Success),
            "failed" => Some(RunOutcome::Failed),
            "cancelled" => Some(RunOutcome::Cancelled),
            "timeout" => Some(RunOutcome::Timeout),
            "orphaned" => Some(RunOutcome::Orphaned),
            _ => None,
        }
    }
}

/// Accumulated token and cost counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }
}

/// Parameters of a status transition
#[derive(Debug, Clone)]
pub struct Transition {
    /// When the transition happened
    pub at: DateTime<Utc>,

    /// Cause recorded on terminal transitions (e.g. `termination_failed`)
    pub reason: Option<String>,

    /// Pid of a process that may have outlived the run
    pub lingering_pid: Option<u32>,
}

impl Transition {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            reason: None,
            lingering_pid: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_lingering_pid(mut self, pid: Option<u32>) -> Self {
        self.lingering_pid = pid;
        self
    }
}

/// One execution of an agent for a task under a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub profile_id: ProfileId,
    pub task_id: TaskId,
    pub runner: RunnerKind,
    pub mode: RunMode,
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Monotonic turn counter
    pub turn: u32,

    /// OS process id while the run holds a process
    pub pid: Option<u32>,

    /// Updated whenever the runner reports activity
    pub last_progress: Option<DateTime<Utc>>,

    pub usage: Usage,

    pub outcome: Option<RunOutcome>,

    /// Cause attached to the terminal transition
    pub outcome_reason: Option<String>,

    pub parent_run_id: Option<RunId>,
    pub idempotency_key: Option<String>,

    /// Workspace allocated for this run, if any
    pub sandbox_path: Option<PathBuf>,

    /// Process that was not confirmed dead when the run ended
    pub lingering_pid: Option<u32>,
}

impl Run {
    /// Create a queued run
    pub fn queued(
        id: RunId,
        profile_id: ProfileId,
        task_id: TaskId,
        runner: RunnerKind,
        mode: RunMode,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            profile_id,
            task_id,
            runner,
            mode,
            status: RunStatus::Queued,
            created_at,
            started_at: None,
            ended_at: None,
            turn: 0,
            pid: None,
            last_progress: None,
            usage: Usage::default(),
            outcome: None,
            outcome_reason: None,
            parent_run_id: None,
            idempotency_key: None,
            sandbox_path: None,
            lingering_pid: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Compare-and-swap the status, maintaining field invariants
    ///
    /// Returns `false` (and leaves the run untouched) when the current status
    /// differs from `expected` or the edge is not allowed.
    pub fn apply_transition(
        &mut self,
        expected: RunStatus,
        next: RunStatus,
        transition: &Transition,
    ) -> bool {
        if self.status != expected || !expected.can_transition_to(next) {
            return false;
        }

        self.status = next;
        match next {
            RunStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(transition.at);
                }
                self.last_progress = Some(
                    self.last_progress
                        .map_or(transition.at, |p| p.max(transition.at)),
                );
            }
            s if s.is_terminal() => {
                let floor = self.last_progress.into_iter().chain(self.started_at).max();
                self.ended_at = Some(floor.map_or(transition.at, |f| f.max(transition.at)));
                self.pid = None;
                self.outcome = s.outcome();
                self.outcome_reason = transition.reason.clone();
                self.lingering_pid = transition.lingering_pid;
            }
            _ => {}
        }
        true
    }

    /// Record runner activity
    ///
    /// Only applies to non-terminal runs. `turn` only moves forward.
    pub fn record_progress(&mut self, progress: &Progress) -> bool {
        if self.is_terminal() {
            return false;
        }
        let floor = self.started_at.unwrap_or(self.created_at);
        let at = progress.at.max(floor);
        self.last_progress = Some(self.last_progress.map_or(at, |p| p.max(at)));
        if let Some(turn) = progress.turn {
            self.turn = self.turn.max(turn);
        }
        if let Some(usage) = &progress.usage {
            self.usage.add(usage);
        }
        true
    }
}

/// Activity reported for a live run
#[derive(Debug, Clone)]
pub struct Progress {
    pub at: DateTime<Utc>,
    pub turn: Option<u32>,
    pub usage: Option<Usage>,
}

impl Progress {
    pub fn touch(at: DateTime<Utc>) -> Self {
        Self {
            at,
            turn: None,
            usage: None,
        }
    }
}

/// Query filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only these statuses (all when empty)
    pub statuses: Vec<RunStatus>,
    pub task_id: Option<TaskId>,
    pub profile_id: Option<ProfileId>,

    /// Only runs carrying a lingering pid
    pub lingering_only: bool,
}

impl RunFilter {
    pub fn non_terminal() -> Self {
        Self {
            statuses: RunStatus::ALL
                .into_iter()
                .filter(|s| !s.is_terminal())
                .collect(),
            ..Default::default()
        }
    }

    pub fn lingering() -> Self {
        Self {
            lingering_only: true,
            ..Default::default()
        }
    }

    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&run.status))
            && self.task_id.as_ref().map_or(true, |t| &run.task_id == t)
            && self.profile_id.as_ref().map_or(true, |p| &run.profile_id == p)
            && (!self.lingering_only || run.lingering_pid.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock;
    use chrono::Duration as ChronoDuration;

    fn queued_run() -> Run {
        Run::queued(
            RunId::new("run_1"),
            ProfileId::new("P1"),
            TaskId::new("T1"),
            RunnerKind::Stub,
            RunMode::Batch,
            clock::now(),
        )
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in RunStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in RunStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_starting_cannot_complete() {
        assert!(!RunStatus::Starting.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Starting.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_cas_rejects_wrong_expected() {
        let mut run = queued_run();
        let t = Transition::at(clock::now());
        assert!(!run.apply_transition(RunStatus::Running, RunStatus::Stopping, &t));
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn test_lifecycle_fields() {
        let mut run = queued_run();
        let t0 = clock::now();
        assert!(run.apply_transition(RunStatus::Queued, RunStatus::Starting, &Transition::at(t0)));
        run.pid = Some(42);

        let t1 = t0 + ChronoDuration::milliseconds(10);
        assert!(run.apply_transition(RunStatus::Starting, RunStatus::Running, &Transition::at(t1)));
        assert_eq!(run.started_at, Some(t1));
        assert_eq!(run.last_progress, Some(t1));

        let t2 = t1 + ChronoDuration::milliseconds(10);
        assert!(run.record_progress(&Progress {
            at: t2,
            turn: Some(1),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.01
            }),
        }));
        assert_eq!(run.turn, 1);

        // an end time earlier than the last progress is clamped
        let t_end = t1;
        assert!(run.apply_transition(
            RunStatus::Running,
            RunStatus::Completed,
            &Transition::at(t_end)
        ));
        assert_eq!(run.pid, None);
        assert_eq!(run.ended_at, Some(t2));
        assert_eq!(run.outcome, Some(RunOutcome::Success));
        assert!(!run.record_progress(&Progress::touch(clock::now())));
    }

    #[test]
    fn test_filter_matches() {
        let run = queued_run();
        assert!(RunFilter::non_terminal().matches(&run));
        assert!(!RunFilter::lingering().matches(&run));
        assert!(RunFilter::for_task(TaskId::new("T1")).matches(&run));
        assert!(!RunFilter::for_task(TaskId::new("T2")).matches(&run));
    }
}
