// src/runners/mod.rs
//! Runner adapters
//!
//! An adapter wraps one external agent binary. The orchestrator only sees the
//! [`RunnerAdapter`] / [`RunnerHandle`] seam:
//!
//! - **CLI adapters**: `claude-code`, `codex`, `opencode` spawned as child
//!   processes, stdout parsed as JSON lines
//! - **Stub**: scripted in-process runner backed by simulated pids
//! - **Unavailable**: fallback for runners that failed their probe; accepts
//!   launches, reports one failure and exits
//!
//! ```text
//! launch() ──► RunnerHandle ──► events(): TurnStarted, Output, ToolInvoked, ...
//!                   │
//!                   ├── terminate(Graceful | Terminate | Kill)
//!                   └── wait() ──► ExitStatus
//! ```

pub mod cli;
pub mod dialect;
pub mod registry;
pub mod stub;

use crate::model::{Checkpoint, Profile, RunId, RunMode, RunnerKind, Task, Usage};
use crate::runtime::process_control::Signal;
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub use cli::CliRunner;
pub use registry::RunnerRegistry;
pub use stub::{StubBehavior, StubRunner, UnavailableRunner};

/// What a runner reports while it works
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerEventKind {
    TurnStarted,
    Output,
    ToolInvoked,
    ToolResult,
    Progress,

    /// The runner could not do its work; not counted as activity
    Failure,
}

/// One item of a runner's event stream
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerEvent {
    pub kind: RunnerEventKind,
    pub payload: serde_json::Value,

    /// Resume marker (e.g. the agent's session id) worth a checkpoint
    pub checkpoint: Option<serde_json::Value>,

    /// Token/cost usage accrued since the previous report
    pub usage: Option<Usage>,
}

impl RunnerEvent {
    pub fn new(kind: RunnerEventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            checkpoint: None,
            usage: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: serde_json::Value) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new(
            RunnerEventKind::Failure,
            serde_json::json!({ "reason": reason.into() }),
        )
    }

    /// Whether this event proves the runner is working
    pub fn is_activity(&self) -> bool {
        self.kind != RunnerEventKind::Failure
    }
}

/// Escalation steps understood by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerSignal {
    /// Ask the agent to wrap up (SIGINT for CLI agents)
    Graceful,

    /// SIGTERM
    Terminate,

    /// SIGKILL
    Kill,
}

impl RunnerSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerSignal::Graceful => "graceful",
            RunnerSignal::Terminate => "terminate",
            RunnerSignal::Kill => "kill",
        }
    }

    pub fn os_signal(&self) -> Signal {
        match self {
            RunnerSignal::Graceful => Signal::Interrupt,
            RunnerSignal::Terminate => Signal::Terminate,
            RunnerSignal::Kill => Signal::Kill,
        }
    }
}

/// How a runner process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal.number()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_std(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Adapter verdict on an exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    Failure(String),
}

/// Everything a runner needs to start
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub run_id: RunId,
    pub mode: RunMode,
    pub profile: Profile,
    pub task: Task,

    /// Working directory; the process cwd when absent
    pub sandbox_path: Option<PathBuf>,

    /// Parent checkpoint for continuation runs
    pub resume_from: Option<Checkpoint>,

    /// Cancelled when the run's supervisor gives up on the launch
    pub cancel: CancellationToken,
}

/// Factory for runner processes of one kind
#[async_trait]
pub trait RunnerAdapter: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Cheap availability probe: `(available, human-readable reason)`
    async fn is_available(&self) -> (bool, String);

    async fn launch(&self, params: LaunchParams) -> Result<Box<dyn RunnerHandle>>;

    /// Map an exit status to an outcome; non-zero exits and signals fail
    fn classify_exit(&self, status: &ExitStatus) -> ExitClass {
        match (status.code, status.signal) {
            (Some(0), _) => ExitClass::Success,
            (Some(code), _) => ExitClass::Failure(format!("exit_code_{}", code)),
            (None, Some(signal)) => ExitClass::Failure(format!("signal_{}", signal)),
            (None, None) => ExitClass::Failure("exit_status_unknown".to_string()),
        }
    }
}

/// A launched runner process
#[async_trait]
pub trait RunnerHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// The event stream; the first call takes it, later calls get an empty stream
    fn events(&mut self) -> BoxStream<'static, RunnerEvent>;

    /// Deliver one escalation step; a process that is already gone is not an error
    async fn terminate(&self, signal: RunnerSignal) -> Result<()>;

    /// Resolves once the process has exited
    async fn wait(&self) -> ExitStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl RunnerAdapter for Probe {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Stub
        }

        async fn is_available(&self) -> (bool, String) {
            (true, "ok".into())
        }

        async fn launch(&self, _params: LaunchParams) -> Result<Box<dyn RunnerHandle>> {
            Err(crate::utils::errors::OrchestratorError::LaunchFailed("probe".into()))
        }
    }

    #[test]
    fn test_default_exit_classification() {
        assert_eq!(Probe.classify_exit(&ExitStatus::code(0)), ExitClass::Success);
        assert_eq!(
            Probe.classify_exit(&ExitStatus::code(2)),
            ExitClass::Failure("exit_code_2".into())
        );
        assert_eq!(
            Probe.classify_exit(&ExitStatus::signaled(Signal::Kill)),
            ExitClass::Failure("signal_9".into())
        );
        assert_eq!(
            Probe.classify_exit(&ExitStatus::default()),
            ExitClass::Failure("exit_status_unknown".into())
        );
    }

    #[test]
    fn test_failure_is_not_activity() {
        assert!(!RunnerEvent::failure("boom").is_activity());
        assert!(RunnerEvent::new(RunnerEventKind::Progress, serde_json::Value::Null).is_activity());
    }
}
