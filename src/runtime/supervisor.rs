// src/runtime/supervisor.rs
//! Per-run supervisor task
//!
//! A supervisor owns one run from `queued` until the run is terminal, or
//! until the run is taken away from it (reconciler orphaned it, control
//! plane shut down while the process kept running). It:
//! - acquires the sandbox and launches the runner
//! - drains runner events into the event log, checkpoints and progress
//! - reacts to stop, timeout and shutdown requests via the run's [`RunControl`]
//! - performs the terminal transition and releases resources on the way out
//!
//! Every status change is a compare-and-swap; a lost CAS means another path
//! already moved the run and the supervisor adopts whatever it finds.

use crate::model::{
    Checkpoint, EventKind, Profile, Progress, Run, RunId, RunStatus, Task, Transition,
};
use crate::observability::TERMINATION_FAILED;
use crate::runners::{
    ExitClass, ExitStatus, LaunchParams, RunnerAdapter, RunnerEvent, RunnerEventKind, RunnerHandle,
};
use crate::runtime::orchestrator::RuntimeContext;
use crate::runtime::run_table::{RunControl, StopReason};
use crate::runtime::terminator::TerminationReport;
use crate::utils::clock;
use crate::utils::errors::Result;
use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

/// Cause recorded when the control plane shuts down under a run
pub const SHUTDOWN_REASON: &str = "control_plane_shutdown";

/// Everything a supervisor needs, fixed at submission time
pub(crate) struct Supervisor {
    ctx: Arc<RuntimeContext>,
    run: Run,
    profile: Profile,
    task: Task,
    resume_from: Option<Checkpoint>,
    control: Arc<RunControl>,
    permit: Option<OwnedSemaphorePermit>,

    /// Status as last written by this supervisor
    status: RunStatus,

    /// Turn counter mirrored from the runner's turn boundaries
    turn: u32,

    /// First failure cause the runner reported
    failure: Option<String>,

    sandbox_held: bool,
}

impl Supervisor {
    pub(crate) fn new(
        ctx: Arc<RuntimeContext>,
        run: Run,
        profile: Profile,
        task: Task,
        resume_from: Option<Checkpoint>,
        control: Arc<RunControl>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let status = run.status;
        Self {
            ctx,
            run,
            profile,
            task,
            resume_from,
            control,
            permit: Some(permit),
            status,
            turn: 0,
            failure: None,
            sandbox_held: false,
        }
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        self.drive().await;
        self.cleanup().await;
    }

    fn id(&self) -> RunId {
        self.run.id.clone()
    }

    async fn drive(&mut self) {
        if !self
            .transition(RunStatus::Queued, RunStatus::Starting, Transition::at(clock::now()))
            .await
        {
            return;
        }

        let sandbox_path = if self
            .profile
            .requires_sandbox(self.ctx.config.require_sandbox_by_default)
        {
            match self.acquire_sandbox().await {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(run_id = %self.run.id, error = %e, "Sandbox acquisition failed");
                    self.settle(
                        RunStatus::Starting,
                        RunStatus::Failed,
                        Some(e.kind().to_string()),
                        None,
                        json!({ "reason": e.kind(), "error": e.to_string() }),
                    )
                    .await;
                    return;
                }
            }
        } else {
            None
        };

        let adapter = self.ctx.registry.resolve(self.profile.runner);
        let params = LaunchParams {
            run_id: self.id(),
            mode: self.run.mode,
            profile: self.profile.clone(),
            task: self.task.clone(),
            sandbox_path,
            resume_from: self.resume_from.clone(),
            cancel: self.ctx.shutdown.child_token(),
        };
        let mut handle = match adapter.launch(params).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(run_id = %self.run.id, runner = %self.profile.runner, error = %e, "Runner launch failed");
                self.settle(
                    RunStatus::Starting,
                    RunStatus::Failed,
                    Some(e.kind().to_string()),
                    None,
                    json!({ "reason": e.kind(), "error": e.to_string() }),
                )
                .await;
                return;
            }
        };

        let pid = handle.pid();
        if let Err(e) = self.ctx.repos.runs.set_pid(&self.run.id, Some(pid)).await {
            warn!(run_id = %self.run.id, pid, error = %e, "Failed to persist pid");
        }
        debug!(run_id = %self.run.id, pid, "Runner launched");

        let events = handle.events();
        self.supervise(adapter, handle, events).await;
    }

    /// Multiplex runner events, exit, stop, timeout and shutdown
    async fn supervise(
        &mut self,
        adapter: Arc<dyn RunnerAdapter>,
        handle: Box<dyn RunnerHandle>,
        mut events: BoxStream<'static, RunnerEvent>,
    ) {
        let ctx = self.ctx.clone();
        let control = self.control.clone();
        let timeout = self.profile.effective_timeout(ctx.config.default_timeout);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut deadline_fired = false;
        let mut stream_done = false;

        // process already gone: stop and deadline yield to the exit
        let mut exit_seen = false;

        loop {
            let stop_armed =
                control.is_orphaned() || (!exit_seen && self.status == RunStatus::Running);

            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => {
                    self.on_shutdown(handle.as_ref()).await;
                    return;
                }
                _ = control.stopped(), if stop_armed => {
                    if control.is_orphaned() {
                        info!(run_id = %self.run.id, "Run orphaned by reconciler, supervisor exiting");
                        return;
                    }
                    if handle.wait().now_or_never().is_some() {
                        debug!(run_id = %self.run.id, "Stop arrived after the runner exited");
                        exit_seen = true;
                        continue;
                    }
                    self.stop_running(handle.as_ref(), &mut events, stream_done).await;
                    return;
                }
                _ = &mut deadline, if !deadline_fired => {
                    deadline_fired = true;
                    if handle.wait().now_or_never().is_some() {
                        debug!(run_id = %self.run.id, "Deadline passed after the runner exited");
                        exit_seen = true;
                        continue;
                    }
                    info!(run_id = %self.run.id, timeout_ms = timeout.as_millis() as u64, "Run timed out");
                    control.request_stop(StopReason::Timeout);
                    if self.status == RunStatus::Starting {
                        let report = ctx.terminator.terminate(handle.as_ref()).await;
                        let lingering = (!report.terminated).then_some(handle.pid());
                        self.settle(
                            RunStatus::Starting,
                            RunStatus::Failed,
                            Some("timeout_before_activity".to_string()),
                            lingering,
                            json!({
                                "reason": "timeout_before_activity",
                                "timeout_ms": timeout.as_millis() as u64,
                                "termination": report.to_json(),
                            }),
                        )
                        .await;
                        return;
                    }
                }
                next = events.next(), if !stream_done => match next {
                    Some(event) => self.on_event(event, handle.pid()).await,
                    None => stream_done = true,
                },
                status = handle.wait(), if stream_done => {
                    self.on_exit(adapter.as_ref(), status).await;
                    return;
                }
            }
        }
    }

    async fn acquire_sandbox(&mut self) -> Result<PathBuf> {
        let id = self.id();
        let sandbox = self.ctx.sandbox.clone();
        let path = self
            .ctx
            .config
            .append_retry
            .run("sandbox_acquire", || sandbox.acquire(&id))
            .await?;
        self.sandbox_held = true;

        if let Err(e) = self.ctx.repos.runs.set_sandbox_path(&id, &path).await {
            warn!(run_id = %id, error = %e, "Failed to persist sandbox path");
        }
        Ok(path)
    }

    async fn on_event(&mut self, event: RunnerEvent, pid: u32) {
        if event.kind == RunnerEventKind::Failure {
            let reason = event
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("runner_failure")
                .to_string();
            warn!(run_id = %self.run.id, reason = %reason, "Runner reported failure");
            self.failure.get_or_insert(reason);
            return;
        }

        let now = clock::now();
        if self.status == RunStatus::Starting
            && self
                .transition(RunStatus::Starting, RunStatus::Running, Transition::at(now))
                .await
        {
            self.ctx
                .log
                .append(
                    &self.run.id,
                    EventKind::RunStarted,
                    json!({
                        "pid": pid,
                        "runner": self.profile.runner.as_str(),
                        "mode": self.run.mode.as_str(),
                    }),
                )
                .await;
        }

        let mut progress = Progress::touch(now);
        progress.usage = event.usage;

        let RunnerEvent {
            kind,
            mut payload,
            checkpoint,
            ..
        } = event;
        let kind = match kind {
            RunnerEventKind::TurnStarted => {
                self.turn += 1;
                progress.turn = Some(self.turn);
                match payload.as_object_mut() {
                    Some(fields) => {
                        fields.insert("turn".to_string(), json!(self.turn));
                    }
                    None => payload = json!({ "turn": self.turn, "detail": payload }),
                }
                EventKind::TurnStarted
            }
            RunnerEventKind::Output => EventKind::RunnerOutput,
            RunnerEventKind::ToolInvoked => EventKind::ToolInvoked,
            RunnerEventKind::ToolResult => EventKind::ToolResult,
            RunnerEventKind::Progress => EventKind::Progress,
            RunnerEventKind::Failure => return,
        };
        self.ctx.log.append(&self.run.id, kind, payload).await;

        if let Some(marker) = checkpoint {
            self.write_checkpoint(marker, now).await;
        }

        let id = self.id();
        let runs = self.ctx.repos.runs.clone();
        if let Err(e) = self
            .ctx
            .config
            .append_retry
            .run("record_progress", || runs.record_progress(&id, &progress))
            .await
        {
            warn!(run_id = %id, error = %e, "Failed to record progress");
        }
    }

    async fn write_checkpoint(&self, payload: Value, at: chrono::DateTime<chrono::Utc>) {
        let checkpoint = Checkpoint {
            run_id: self.id(),
            turn: self.turn,
            payload,
            created_at: at,
        };
        let repo = self.ctx.repos.checkpoints.clone();
        match self
            .ctx
            .config
            .append_retry
            .run("checkpoint_append", || repo.append_checkpoint(checkpoint.clone()))
            .await
        {
            Ok(()) => {
                self.ctx
                    .log
                    .append(
                        &self.run.id,
                        EventKind::CheckpointWritten,
                        json!({ "turn": self.turn }),
                    )
                    .await;
            }
            Err(e) => {
                error!(run_id = %self.run.id, turn = self.turn, error = %e, "Failed to write checkpoint");
            }
        }
    }

    /// Runner exited on its own
    async fn on_exit(&mut self, adapter: &dyn RunnerAdapter, status: ExitStatus) {
        let exit = json!(status);
        match self.status {
            RunStatus::Starting => {
                let reason = self
                    .failure
                    .take()
                    .unwrap_or_else(|| "exited_before_activity".to_string());
                self.settle(
                    RunStatus::Starting,
                    RunStatus::Failed,
                    Some(reason.clone()),
                    None,
                    json!({ "reason": reason, "exit": exit }),
                )
                .await;
            }
            RunStatus::Running => {
                let class = match self.failure.take() {
                    Some(reason) => ExitClass::Failure(reason),
                    None => adapter.classify_exit(&status),
                };
                match class {
                    ExitClass::Success => {
                        self.settle(
                            RunStatus::Running,
                            RunStatus::Completed,
                            None,
                            None,
                            json!({ "exit": exit, "turns": self.turn }),
                        )
                        .await;
                    }
                    ExitClass::Failure(reason) => {
                        self.settle(
                            RunStatus::Running,
                            RunStatus::Failed,
                            Some(reason.clone()),
                            None,
                            json!({ "reason": reason, "exit": exit, "turns": self.turn }),
                        )
                        .await;
                    }
                }
            }
            other => {
                debug!(run_id = %self.run.id, status = %other, "Exit observed after status moved on");
            }
        }
    }

    /// Stop accepted while running: `running → stopping → cancelled | timeout | failed`
    async fn stop_running(
        &mut self,
        handle: &dyn RunnerHandle,
        events: &mut BoxStream<'static, RunnerEvent>,
        stream_done: bool,
    ) {
        let reason = self.control.stop_reason().unwrap_or(StopReason::Cancel {
            reason: "cancelled".to_string(),
        });

        if !self
            .transition(RunStatus::Running, RunStatus::Stopping, Transition::at(clock::now()))
            .await
        {
            return;
        }
        self.ctx
            .log
            .append(
                &self.run.id,
                EventKind::RunStopping,
                json!({ "reason": reason.as_str() }),
            )
            .await;

        let terminator = self.ctx.terminator.clone();
        let terminate = terminator.terminate(handle);
        tokio::pin!(terminate);
        let mut drained = stream_done;
        let report = loop {
            tokio::select! {
                report = &mut terminate => break report,
                next = events.next(), if !drained => match next {
                    Some(event) => self.on_event(event, handle.pid()).await,
                    None => drained = true,
                },
            }
        };

        self.settle_stop(reason, report, handle.pid()).await;
    }

    async fn settle_stop(&mut self, reason: StopReason, report: TerminationReport, pid: u32) {
        if !report.terminated {
            error!(
                run_id = %self.run.id,
                pid,
                attempts = report.attempts.len(),
                "Termination failed, process may be lingering"
            );
            self.ctx.metrics.incr_counter(TERMINATION_FAILED, &[]);
            self.settle(
                RunStatus::Stopping,
                RunStatus::Failed,
                Some("termination_failed".to_string()),
                Some(pid),
                json!({
                    "reason": "termination_failed",
                    "stop_reason": reason.as_str(),
                    "termination": report.to_json(),
                }),
            )
            .await;
            return;
        }

        let (next, payload) = match &reason {
            StopReason::Timeout => (
                RunStatus::Timeout,
                json!({
                    "reason": "timeout",
                    "timeout_ms": self.profile.effective_timeout(self.ctx.config.default_timeout).as_millis() as u64,
                    "termination": report.to_json(),
                }),
            ),
            _ => (
                RunStatus::Cancelled,
                json!({ "reason": reason.as_str(), "termination": report.to_json() }),
            ),
        };
        self.settle(
            RunStatus::Stopping,
            next,
            Some(reason.as_str().to_string()),
            None,
            payload,
        )
        .await;
    }

    /// One graceful attempt; the run is only settled if the process went away
    async fn on_shutdown(&mut self, handle: &dyn RunnerHandle) {
        let report = self.ctx.terminator.graceful_only(handle).await;
        if !report.terminated {
            info!(
                run_id = %self.run.id,
                pid = handle.pid(),
                status = %self.status,
                "Process outlived shutdown, leaving run for the reconciler"
            );
            return;
        }

        let payload = json!({ "reason": SHUTDOWN_REASON, "termination": report.to_json() });
        match self.status {
            RunStatus::Starting => {
                self.settle(
                    RunStatus::Starting,
                    RunStatus::Failed,
                    Some(SHUTDOWN_REASON.to_string()),
                    None,
                    payload,
                )
                .await;
            }
            RunStatus::Running => {
                if self
                    .transition(RunStatus::Running, RunStatus::Stopping, Transition::at(clock::now()))
                    .await
                {
                    self.ctx
                        .log
                        .append(
                            &self.run.id,
                            EventKind::RunStopping,
                            json!({ "reason": SHUTDOWN_REASON }),
                        )
                        .await;
                    self.settle(
                        RunStatus::Stopping,
                        RunStatus::Cancelled,
                        Some(SHUTDOWN_REASON.to_string()),
                        None,
                        payload,
                    )
                    .await;
                }
            }
            other => {
                debug!(run_id = %self.run.id, status = %other, "Nothing to settle on shutdown");
            }
        }
    }

    /// Status CAS; adopts the stored status when another path won
    async fn transition(&mut self, from: RunStatus, to: RunStatus, transition: Transition) -> bool {
        let id = self.id();
        match self.ctx.transition(&id, from, to, &transition).await {
            Ok(true) => {
                self.status = to;
                true
            }
            Ok(false) => {
                self.adopt_stored_status().await;
                debug!(run_id = %id, from = %from, to = %to, now = %self.status, "Transition lost");
                false
            }
            Err(e) => {
                error!(run_id = %id, from = %from, to = %to, error = %e, "Run transition failed");
                false
            }
        }
    }

    /// Terminal CAS plus the matching terminal event
    async fn settle(
        &mut self,
        from: RunStatus,
        to: RunStatus,
        reason: Option<String>,
        lingering_pid: Option<u32>,
        payload: Value,
    ) {
        let id = self.id();
        let mut transition = Transition::at(clock::now()).with_lingering_pid(lingering_pid);
        if let Some(reason) = reason {
            transition = transition.with_reason(reason);
        }

        match self.ctx.settle(&id, from, to, &transition, payload).await {
            Ok(true) => self.status = to,
            Ok(false) => {
                self.adopt_stored_status().await;
                debug!(run_id = %id, from = %from, to = %to, now = %self.status, "Terminal transition lost");
            }
            Err(e) => {
                error!(run_id = %id, from = %from, to = %to, error = %e, "Terminal transition failed");
            }
        }
    }

    async fn adopt_stored_status(&mut self) {
        if let Ok(Some(run)) = self.ctx.repos.runs.get_run(&self.run.id).await {
            self.status = run.status;
        }
    }

    /// Release what the run holds once it is terminal; always frees the slot
    async fn cleanup(&mut self) {
        let id = self.id();
        let stored = match self.ctx.repos.runs.get_run(&id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %id, error = %e, "Failed to load run during cleanup");
                None
            }
        };

        if let Some(run) = stored.filter(Run::is_terminal) {
            if self.sandbox_held {
                let sandbox = self.ctx.sandbox.clone();
                match self
                    .ctx
                    .config
                    .append_retry
                    .run("sandbox_release", || sandbox.release(&id))
                    .await
                {
                    Ok(()) => self.sandbox_held = false,
                    Err(e) => warn!(run_id = %id, error = %e, "Sandbox release failed"),
                }
            }

            self.ctx.log.forget(&id);
            self.ctx.refresh_task(&self.task.id).await;
            info!(run_id = %id, status = %run.status, reason = ?run.outcome_reason, "Run finished");
        } else {
            info!(run_id = %id, "Supervisor exiting with run still live");
        }

        self.ctx.runs.remove(&id);
        self.permit.take();
        self.ctx.report_active();
        self.control.mark_finished();
    }
}
