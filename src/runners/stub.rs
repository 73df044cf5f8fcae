// src/runners/stub.rs
//! In-process runners backed by simulated pids
//!
//! [`StubRunner`] plays a scripted behavior. The script comes from the
//! profile's `model` field when it parses as one (`"sleep:10000"`), otherwise
//! from the runner's default. [`UnavailableRunner`] stands in for adapters
//! whose probe failed.

use crate::model::RunnerKind;
use crate::runners::{
    ExitStatus, LaunchParams, RunnerAdapter, RunnerEvent, RunnerEventKind, RunnerHandle,
    RunnerSignal,
};
use crate::runtime::process_control::{ProcessControl, SimulatedProcesses};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Scripted stub behaviors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    /// One turn, one output, exit 0
    Succeed,

    /// One turn, then wait before finishing (unless terminated first)
    Sleep(Duration),

    /// Like `Succeed`, with a checkpoint marker on the turn
    Checkpoint,

    /// One turn, one output, exit 1
    Fail,

    /// `launch` itself errors
    FailLaunch,

    /// Exit 1 before reporting anything
    ExitBeforeActivity,

    /// One turn, then ignore every signal until killed externally
    IgnoreTermination,
}

impl FromStr for StubBehavior {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(ms) = s.strip_prefix("sleep:") {
            let ms = ms
                .parse::<u64>()
                .map_err(|_| OrchestratorError::InvalidInput(format!("bad stub sleep '{}'", s)))?;
            return Ok(StubBehavior::Sleep(Duration::from_millis(ms)));
        }
        match s {
            "succeed" => Ok(StubBehavior::Succeed),
            "checkpoint" => Ok(StubBehavior::Checkpoint),
            "fail" => Ok(StubBehavior::Fail),
            "fail-launch" => Ok(StubBehavior::FailLaunch),
            "exit-early" => Ok(StubBehavior::ExitBeforeActivity),
            "ignore-termination" => Ok(StubBehavior::IgnoreTermination),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown stub script '{}'",
                other
            ))),
        }
    }
}

/// Handle over a simulated process
struct SimulatedHandle {
    pid: u32,
    processes: Arc<SimulatedProcesses>,
    exit: watch::Receiver<Option<ExitStatus>>,
    events: Option<mpsc::Receiver<RunnerEvent>>,
}

impl SimulatedHandle {
    fn new(
        pid: u32,
        processes: Arc<SimulatedProcesses>,
        exit: watch::Receiver<Option<ExitStatus>>,
        events: mpsc::Receiver<RunnerEvent>,
    ) -> Self {
        Self {
            pid,
            processes,
            exit,
            events: Some(events),
        }
    }
}

#[async_trait]
impl RunnerHandle for SimulatedHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn events(&mut self) -> BoxStream<'static, RunnerEvent> {
        match self.events.take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn terminate(&self, signal: RunnerSignal) -> Result<()> {
        self.processes.signal(self.pid, signal.os_signal())
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).unwrap_or_default(),
            Err(_) => ExitStatus::default(),
        };
        status
    }
}

async fn exited(exit: &mut watch::Receiver<Option<ExitStatus>>) {
    let _ = exit.wait_for(|status| status.is_some()).await;
}

/// Play `behavior` for simulated process `pid`
async fn play(
    behavior: StubBehavior,
    params: LaunchParams,
    pid: u32,
    processes: Arc<SimulatedProcesses>,
    events: mpsc::Sender<RunnerEvent>,
    mut exit: watch::Receiver<Option<ExitStatus>>,
) {
    let turn = RunnerEvent::new(RunnerEventKind::TurnStarted, json!({ "turn": 1 }));
    let mut output = json!({ "text": format!("stub finished {}", params.task.id) });
    if let Some(checkpoint) = &params.resume_from {
        output["resumed_from"] = checkpoint.payload.clone();
    }
    let output = RunnerEvent::new(RunnerEventKind::Output, output);

    match behavior {
        StubBehavior::Succeed | StubBehavior::Fail => {
            let _ = events.send(turn).await;
            let _ = events.send(output).await;
            let code = if behavior == StubBehavior::Fail { 1 } else { 0 };
            processes.exit(pid, ExitStatus::code(code));
        }
        StubBehavior::Checkpoint => {
            let marker = json!({ "session_id": format!("stub-{}", params.run_id) });
            let _ = events.send(turn.with_checkpoint(marker)).await;
            let _ = events.send(output).await;
            processes.exit(pid, ExitStatus::code(0));
        }
        StubBehavior::Sleep(duration) => {
            let _ = events.send(turn).await;
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    // killed behind our back while sleeping
                    if processes.is_alive(pid) {
                        let _ = events.send(output).await;
                        processes.exit(pid, ExitStatus::code(0));
                    }
                }
                _ = exited(&mut exit) => {}
            }
        }
        StubBehavior::IgnoreTermination => {
            let _ = events.send(turn).await;
            exited(&mut exit).await;
        }
        StubBehavior::ExitBeforeActivity => {
            processes.exit(pid, ExitStatus::code(1));
        }
        StubBehavior::FailLaunch => {}
    }
    debug!(pid, ?behavior, "Stub script finished");
}

/// Scripted runner
pub struct StubRunner {
    processes: Arc<SimulatedProcesses>,
    default_behavior: StubBehavior,
}

impl StubRunner {
    pub fn new(processes: Arc<SimulatedProcesses>) -> Self {
        Self {
            processes,
            default_behavior: StubBehavior::Succeed,
        }
    }

    pub fn with_behavior(mut self, behavior: StubBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    fn behavior_for(&self, params: &LaunchParams) -> Result<StubBehavior> {
        match params.profile.model.as_deref() {
            Some(script) => script.parse(),
            None => Ok(self.default_behavior),
        }
    }
}

#[async_trait]
impl RunnerAdapter for StubRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Stub
    }

    async fn is_available(&self) -> (bool, String) {
        (true, "stub runner is always available".to_string())
    }

    async fn launch(&self, params: LaunchParams) -> Result<Box<dyn RunnerHandle>> {
        let behavior = self.behavior_for(&params)?;
        if behavior == StubBehavior::FailLaunch {
            return Err(OrchestratorError::LaunchFailed(
                "stub configured to fail launch".to_string(),
            ));
        }

        let (pid, exit) = self
            .processes
            .spawn(behavior == StubBehavior::IgnoreTermination);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(play(
            behavior,
            params,
            pid,
            self.processes.clone(),
            tx,
            exit.clone(),
        ));

        Ok(Box::new(SimulatedHandle::new(
            pid,
            self.processes.clone(),
            exit,
            rx,
        )))
    }
}

/// Fallback for a runner whose availability probe failed
pub struct UnavailableRunner {
    kind: RunnerKind,
    reason: String,
    processes: Arc<SimulatedProcesses>,
}

impl UnavailableRunner {
    pub fn new(kind: RunnerKind, reason: impl Into<String>, processes: Arc<SimulatedProcesses>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            processes,
        }
    }
}

#[async_trait]
impl RunnerAdapter for UnavailableRunner {
    fn kind(&self) -> RunnerKind {
        self.kind
    }

    async fn is_available(&self) -> (bool, String) {
        (false, self.reason.clone())
    }

    async fn launch(&self, _params: LaunchParams) -> Result<Box<dyn RunnerHandle>> {
        let (pid, exit) = self.processes.spawn(false);
        let (tx, rx) = mpsc::channel(1);

        let failure = RunnerEvent::new(
            RunnerEventKind::Failure,
            json!({
                "reason": "runner_unavailable",
                "runner": self.kind.as_str(),
                "detail": self.reason,
            }),
        );
        let processes = self.processes.clone();
        tokio::spawn(async move {
            let _ = tx.send(failure).await;
            processes.exit(pid, ExitStatus::code(1));
        });

        Ok(Box::new(SimulatedHandle::new(
            pid,
            self.processes.clone(),
            exit,
            rx,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Profile, RunId, RunMode, Task};
    use crate::utils::clock;
    use tokio_util::sync::CancellationToken;

    fn params(script: Option<&str>) -> LaunchParams {
        let mut profile = Profile::new("P1", RunnerKind::Stub);
        profile.model = script.map(str::to_string);
        LaunchParams {
            run_id: RunId::new("r1"),
            mode: RunMode::Batch,
            profile,
            task: Task::new("T1", "P1", "say hi", clock::now()),
            sandbox_path: None,
            resume_from: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_script_parsing() {
        assert_eq!("succeed".parse::<StubBehavior>().unwrap(), StubBehavior::Succeed);
        assert_eq!(
            "sleep:250".parse::<StubBehavior>().unwrap(),
            StubBehavior::Sleep(Duration::from_millis(250))
        );
        assert!("sleep:soon".parse::<StubBehavior>().is_err());
        assert!("dance".parse::<StubBehavior>().is_err());
    }

    #[tokio::test]
    async fn test_success_script() {
        let processes = Arc::new(SimulatedProcesses::new());
        let runner = StubRunner::new(processes.clone());
        let mut handle = runner.launch(params(None)).await.unwrap();
        assert!(SimulatedProcesses::is_simulated(handle.pid()));

        let kinds: Vec<_> = handle.events().map(|e| e.kind).collect().await;
        assert_eq!(kinds, vec![RunnerEventKind::TurnStarted, RunnerEventKind::Output]);
        assert!(handle.wait().await.success());
        assert!(!processes.is_alive(handle.pid()));

        // the stream can only be taken once
        assert!(handle.events().next().await.is_none());
    }

    #[tokio::test]
    async fn test_sleeper_exits_on_graceful_terminate() {
        let processes = Arc::new(SimulatedProcesses::new());
        let runner = StubRunner::new(processes.clone());
        let mut handle = runner.launch(params(Some("sleep:60000"))).await.unwrap();
        let mut events = handle.events();

        assert_eq!(events.next().await.unwrap().kind, RunnerEventKind::TurnStarted);
        handle.terminate(RunnerSignal::Graceful).await.unwrap();

        assert!(events.next().await.is_none());
        assert_eq!(handle.wait().await.signal, Some(2));
    }

    #[tokio::test]
    async fn test_sleeper_killed_externally_stays_dead() {
        let processes = Arc::new(SimulatedProcesses::new());
        let runner = StubRunner::new(processes.clone());
        let mut handle = runner.launch(params(Some("sleep:50"))).await.unwrap();
        let mut events = handle.events();

        assert_eq!(events.next().await.unwrap().kind, RunnerEventKind::TurnStarted);
        assert!(processes.kill_externally(handle.pid()));

        // the script wakes up, finds its pid gone, and reports nothing more
        assert!(events.next().await.is_none());
        assert!(!processes.is_alive(handle.pid()));
        assert_eq!(processes.live_count(), 0);
        let waited = tokio::time::timeout(Duration::from_millis(100), handle.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_fail_launch() {
        let runner = StubRunner::new(Arc::new(SimulatedProcesses::new()));
        assert!(matches!(
            runner.launch(params(Some("fail-launch"))).await,
            Err(OrchestratorError::LaunchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_runner_reports_one_failure() {
        let processes = Arc::new(SimulatedProcesses::new());
        let runner = UnavailableRunner::new(RunnerKind::Codex, "codex not found in PATH", processes);
        assert_eq!(runner.is_available().await.0, false);

        let mut handle = runner.launch(params(None)).await.unwrap();
        let events: Vec<_> = handle.events().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RunnerEventKind::Failure);
        assert_eq!(events[0].payload["reason"], "runner_unavailable");
        assert_eq!(handle.wait().await.code, Some(1));
    }
}
