// src/runtime/orchestrator.rs
//! Orchestrator: admission, idempotency and the run lifecycle entry points
//!
//! Submissions are serialized through an admission lock so the idempotency
//! lookup, the capacity check and the insert of the new run happen as one
//! step. Each admitted run gets a [`Supervisor`] task holding one admission
//! permit until it exits.

use crate::events::broadcaster::DEFAULT_SUBSCRIBER_QUEUE;
use crate::events::{Broadcaster, BroadcasterStats, EventLog, Subscription};
use crate::model::idempotency::fingerprint;
use crate::model::{
    Checkpoint, Event, EventKind, IdempotencyRecord, Profile, ProfileId, Run, RunFilter, RunId,
    RunMode, RunStatus, Task, TaskId, TaskStatus, Transition,
};
use crate::observability::{
    MetricsRecorder, NoopMetrics, ACTIVE_RUNS, RUNS_REJECTED, RUNS_SUBMITTED, RUNS_TERMINAL,
    TERMINATION_FAILED,
};
use crate::runners::registry::RunnerRegistry;
use crate::runners::stub::StubRunner;
use crate::runtime::process_control::{HostProcessControl, ProcessControl, SimulatedProcesses};
use crate::runtime::reconciler::{Reconciler, ReconcilerConfig};
use crate::runtime::run_table::{RunControl, RunTable, StopReason};
use crate::runtime::supervisor::Supervisor;
use crate::runtime::terminator::{TerminationReport, Terminator, TerminatorConfig};
use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
use crate::storage::Repositories;
use crate::utils::clock;
use crate::utils::errors::{OrchestratorError, Result};
use crate::utils::retry::RetryPolicy;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator limits and defaults
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Timeout for profiles that do not set one
    pub default_timeout: Duration,

    /// Cap on runs in `starting | running | stopping`
    pub max_concurrent_runs: usize,

    /// Sandbox requirement for profiles that do not set one
    pub require_sandbox_by_default: bool,

    /// Backoff for event appends and other storage writes
    pub append_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1800),
            max_concurrent_runs: 10,
            require_sandbox_by_default: true,
            append_retry: RetryPolicy::default(),
        }
    }
}

/// Submission parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub profile_id: ProfileId,
    pub task_id: TaskId,
    pub parent_run_id: Option<RunId>,
    pub idempotency_key: Option<String>,
    pub mode: RunMode,
}

impl SubmitRequest {
    pub fn new(profile_id: impl Into<ProfileId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            profile_id: profile_id.into(),
            task_id: task_id.into(),
            parent_run_id: None,
            idempotency_key: None,
            mode: RunMode::Batch,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_parent(mut self, parent: RunId) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Fingerprint compared when an idempotency key is reused
    pub fn fingerprint(&self) -> String {
        fingerprint(&[
            self.profile_id.as_str(),
            self.task_id.as_str(),
            self.parent_run_id.as_ref().map_or("", |p| p.as_str()),
            self.mode.as_str(),
        ])
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The stop is in progress; `wait` observes the terminal state
    Accepted,

    /// Nothing to do; the run had already ended
    AlreadyTerminal(RunStatus),
}

/// Components shared by the orchestrator, supervisors and the reconciler
pub(crate) struct RuntimeContext {
    pub(crate) repos: Repositories,
    pub(crate) log: Arc<EventLog>,
    pub(crate) broadcaster: Arc<Broadcaster>,
    pub(crate) registry: Arc<RunnerRegistry>,
    pub(crate) sandbox: Arc<dyn SandboxProvider>,
    pub(crate) terminator: Arc<Terminator>,
    pub(crate) process_control: Arc<dyn ProcessControl>,
    pub(crate) runs: RunTable,
    pub(crate) admission: Arc<Semaphore>,
    pub(crate) metrics: Arc<dyn MetricsRecorder>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) shutdown: CancellationToken,

    /// Serializes task status recomputation
    pub(crate) task_updates: Mutex<()>,
}

impl RuntimeContext {
    /// Publish the number of runs holding an admission permit
    pub(crate) fn report_active(&self) {
        let active = self
            .config
            .max_concurrent_runs
            .saturating_sub(self.admission.available_permits());
        self.metrics.set_gauge(ACTIVE_RUNS, active as f64);
    }

    /// Status CAS with storage retries
    pub(crate) async fn transition(
        &self,
        run_id: &RunId,
        from: RunStatus,
        to: RunStatus,
        transition: &Transition,
    ) -> Result<bool> {
        let runs = self.repos.runs.clone();
        let moved = self
            .config
            .append_retry
            .run("run_transition", || {
                runs.compare_and_swap_status(run_id, from, to, transition)
            })
            .await?;
        if moved {
            info!(run_id = %run_id, from = %from, to = %to, "Run transition");
        }
        Ok(moved)
    }

    /// Terminal CAS followed by the matching terminal event
    ///
    /// Returns false when another path already moved the run.
    pub(crate) async fn settle(
        &self,
        run_id: &RunId,
        from: RunStatus,
        to: RunStatus,
        transition: &Transition,
        payload: Value,
    ) -> Result<bool> {
        if !self.transition(run_id, from, to, transition).await? {
            return Ok(false);
        }
        if let Some(kind) = EventKind::for_terminal_status(to) {
            self.log.append(run_id, kind, payload).await;
        }
        self.log.forget(run_id);
        self.metrics
            .incr_counter(RUNS_TERMINAL, &[("status", to.as_str().to_string())]);
        Ok(true)
    }

    /// Sandbox and task bookkeeping for a terminal run nobody supervises
    pub(crate) async fn release_detached(&self, run: &Run) {
        if run.sandbox_path.is_some() {
            let sandbox = self.sandbox.clone();
            if let Err(e) = self
                .config
                .append_retry
                .run("sandbox_release", || sandbox.release(&run.id))
                .await
            {
                warn!(run_id = %run.id, error = %e, "Sandbox release failed");
            }
        }
        self.refresh_task(&run.task_id).await;
    }

    /// Recompute a task's status from all of its runs
    ///
    /// The task stays `in_progress` while any of its runs is non-terminal and
    /// `latest_run_id` always names its newest run. Otherwise the newest
    /// run's outcome decides.
    pub(crate) async fn refresh_task(&self, task_id: &TaskId) {
        let _serialized = self.task_updates.lock().await;
        let runs = match self
            .repos
            .runs
            .list_runs(&RunFilter::for_task(task_id.clone()))
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to list task runs");
                return;
            }
        };
        let Some(latest) = runs.iter().max_by(|a, b| {
            (a.created_at, &a.id).cmp(&(b.created_at, &b.id))
        }) else {
            return;
        };

        let status = if runs.iter().any(|run| !run.is_terminal()) {
            TaskStatus::InProgress
        } else {
            TaskStatus::after_run(latest.status)
        };
        match self
            .repos
            .tasks
            .update_task(task_id, status, Some(&latest.id), clock::now())
            .await
        {
            Ok(_) => debug!(task_id = %task_id, status = status.as_str(), latest_run = %latest.id, "Task refreshed"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to update task"),
        }
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    repos: Repositories,
    config: OrchestratorConfig,
    terminator: TerminatorConfig,
    registry: Option<RunnerRegistry>,
    processes: Option<Arc<SimulatedProcesses>>,
    process_control: Option<Arc<dyn ProcessControl>>,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    metrics: Arc<dyn MetricsRecorder>,
    broadcaster_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn terminator(mut self, config: TerminatorConfig) -> Self {
        self.terminator = config;
        self
    }

    /// Runner table; defaults to the stub runner alone
    pub fn registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Pid table shared with stub runners
    pub fn processes(mut self, processes: Arc<SimulatedProcesses>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Liveness probes and signals; defaults to host processes plus the simulated table
    pub fn process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.process_control = Some(control);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn broadcaster_capacity(mut self, capacity: usize) -> Self {
        self.broadcaster_capacity = capacity;
        self
    }

    pub fn build(self) -> Orchestrator {
        let processes = self.processes.unwrap_or_default();
        let process_control = self
            .process_control
            .unwrap_or_else(|| Arc::new(HostProcessControl::new(processes.clone())));
        let registry = self.registry.unwrap_or_else(|| {
            let mut registry = RunnerRegistry::new(processes.clone());
            registry.register(Arc::new(StubRunner::new(processes.clone())));
            registry
        });
        let sandbox = self.sandbox.unwrap_or_else(|| {
            Arc::new(LocalSandboxProvider::new(
                std::env::temp_dir().join("agent-orchestrator"),
            ))
        });

        let broadcaster = Arc::new(Broadcaster::new(
            self.broadcaster_capacity,
            self.metrics.clone(),
        ));
        let log = Arc::new(EventLog::new(
            self.repos.events.clone(),
            broadcaster.clone(),
            self.config.append_retry.clone(),
            self.metrics.clone(),
        ));
        let terminator = Arc::new(Terminator::new(self.terminator, process_control.clone()));

        let ctx = RuntimeContext {
            repos: self.repos,
            log,
            broadcaster,
            registry: Arc::new(registry),
            sandbox,
            terminator,
            process_control,
            runs: RunTable::new(),
            admission: Arc::new(Semaphore::new(self.config.max_concurrent_runs)),
            metrics: self.metrics,
            config: self.config,
            shutdown: CancellationToken::new(),
            task_updates: Mutex::new(()),
        };

        Orchestrator {
            ctx: Arc::new(ctx),
            admission_lock: Mutex::new(()),
        }
    }
}

/// Run orchestrator
pub struct Orchestrator {
    ctx: Arc<RuntimeContext>,

    /// Serializes idempotency lookup, capacity check and insert
    admission_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn builder(repos: Repositories) -> OrchestratorBuilder {
        OrchestratorBuilder {
            repos,
            config: OrchestratorConfig::default(),
            terminator: TerminatorConfig::default(),
            registry: None,
            processes: None,
            process_control: None,
            sandbox: None,
            metrics: Arc::new(NoopMetrics),
            broadcaster_capacity: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.ctx.config
    }

    /// Admit a run and spawn its supervisor
    ///
    /// A request carrying a known idempotency key returns the original run
    /// without doing any work; a different request under the same key is
    /// rejected with `InvalidInput`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Run> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(OrchestratorError::InvalidInput(
                "orchestrator is shutting down".to_string(),
            ));
        }

        let _admission = self.admission_lock.lock().await;
        let request_fingerprint = request.fingerprint();

        if let Some(key) = &request.idempotency_key {
            if let Some(record) = self.ctx.repos.idempotency.get_idempotency(key).await? {
                return self.replay(record, &request_fingerprint).await;
            }
        }

        let (profile, task, resume_from) = match self.validate(&request).await {
            Ok(validated) => validated,
            Err(e) => {
                self.reject(e.kind());
                return Err(e);
            }
        };

        let permit = match self.ctx.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let max = self.ctx.config.max_concurrent_runs;
                warn!(profile_id = %request.profile_id, task_id = %request.task_id, max, "Submission rejected at capacity");
                self.reject("at_capacity");
                return Err(OrchestratorError::AtCapacity { max });
            }
        };

        let now = clock::now();
        let mut run = Run::queued(
            RunId::generate(),
            profile.id.clone(),
            task.id.clone(),
            profile.runner,
            request.mode,
            now,
        );
        run.parent_run_id = request.parent_run_id.clone();
        run.idempotency_key = request.idempotency_key.clone();
        self.ctx.repos.runs.create_run(run.clone()).await?;

        if let Some(key) = &request.idempotency_key {
            let record = IdempotencyRecord {
                key: key.clone(),
                fingerprint: request_fingerprint.clone(),
                run_id: run.id.clone(),
                created_at: now,
            };
            match self.ctx.repos.idempotency.put_if_absent(record).await {
                Ok(None) => {}
                Ok(Some(existing)) => {
                    // another control plane on the same store won the key
                    self.fail_unlaunched(&run.id, "idempotency_conflict").await;
                    return self.replay(existing, &request_fingerprint).await;
                }
                Err(e) => {
                    self.fail_unlaunched(&run.id, e.kind()).await;
                    return Err(e);
                }
            }
        }

        self.ctx
            .log
            .append(
                &run.id,
                EventKind::RunCreated,
                json!({
                    "profile_id": profile.id,
                    "task_id": task.id,
                    "runner": profile.runner.as_str(),
                    "mode": run.mode.as_str(),
                    "parent_run_id": run.parent_run_id,
                }),
            )
            .await;
        self.ctx.refresh_task(&task.id).await;

        let control = self.ctx.runs.insert(&run.id).ok_or_else(|| {
            OrchestratorError::InvalidInput(format!("run {} is already supervised", run.id))
        })?;
        Supervisor::new(
            self.ctx.clone(),
            run.clone(),
            profile,
            task,
            resume_from,
            control,
            permit,
        )
        .spawn();

        self.ctx.metrics.incr_counter(
            RUNS_SUBMITTED,
            &[
                ("runner", run.runner.as_str().to_string()),
                ("mode", run.mode.as_str().to_string()),
            ],
        );
        self.ctx.report_active();
        info!(run_id = %run.id, profile_id = %run.profile_id, task_id = %run.task_id, mode = run.mode.as_str(), "Run submitted");
        Ok(run)
    }

    /// Continue a terminal run from its latest checkpoint
    pub async fn resume(&self, run_id: &RunId, idempotency_key: Option<String>) -> Result<Run> {
        let parent = self.get_run(run_id).await?;
        let mut request = SubmitRequest::new(parent.profile_id, parent.task_id)
            .with_mode(RunMode::Continuation)
            .with_parent(parent.id);
        request.idempotency_key = idempotency_key;
        self.submit(request).await
    }

    /// Ask a run to stop
    ///
    /// Idempotent: an already terminal run reports its terminal status. A
    /// supervised run is handed to its supervisor; a run nobody supervises
    /// (control plane restarted under it) is stopped directly by pid.
    pub async fn stop(&self, run_id: &RunId, reason: &str) -> Result<StopOutcome> {
        let run = self.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(StopOutcome::AlreadyTerminal(run.status));
        }

        let stop = StopReason::Cancel {
            reason: reason.to_string(),
        };
        if let Some(control) = self.ctx.runs.get(run_id) {
            control.request_stop(stop);
            info!(run_id = %run_id, reason, status = %run.status, "Stop requested");
            return Ok(StopOutcome::Accepted);
        }

        let Some(control) = self.ctx.runs.insert(run_id) else {
            // a supervisor or another stop claimed it in the meantime
            if let Some(control) = self.ctx.runs.get(run_id) {
                control.request_stop(stop);
            }
            return Ok(StopOutcome::Accepted);
        };
        control.request_stop(stop);
        self.stop_detached(run, reason.to_string(), control).await
    }

    async fn stop_detached(
        &self,
        run: Run,
        reason: String,
        control: Arc<RunControl>,
    ) -> Result<StopOutcome> {
        let ctx = self.ctx.clone();
        let mut from = run.status;

        if from == RunStatus::Running {
            let moved = ctx
                .transition(&run.id, RunStatus::Running, RunStatus::Stopping, &Transition::at(clock::now()))
                .await;
            match moved {
                Ok(true) => {
                    ctx.log
                        .append(&run.id, EventKind::RunStopping, json!({ "reason": reason }))
                        .await;
                    from = RunStatus::Stopping;
                }
                other => {
                    ctx.runs.remove(&run.id);
                    control.mark_finished();
                    other?;
                    return self.current_outcome(&run.id).await;
                }
            }
        }

        info!(run_id = %run.id, status = %from, pid = ?run.pid, "Stopping unsupervised run");
        tokio::spawn(async move {
            finish_detached_stop(&ctx, run, from, reason).await;
            ctx.runs.remove(control.run_id());
            control.mark_finished();
        });
        Ok(StopOutcome::Accepted)
    }

    async fn current_outcome(&self, run_id: &RunId) -> Result<StopOutcome> {
        let run = self.get_run(run_id).await?;
        Ok(if run.is_terminal() {
            StopOutcome::AlreadyTerminal(run.status)
        } else {
            StopOutcome::Accepted
        })
    }

    /// Wait for the run's supervisor (if any) to exit, then return the run
    ///
    /// A run nobody supervises is returned as stored.
    pub async fn wait(&self, run_id: &RunId) -> Result<Run> {
        if let Some(control) = self.ctx.runs.get(run_id) {
            control.finished().await;
        }
        self.get_run(run_id).await
    }

    /// Cancel every supervisor and wait for them to exit
    ///
    /// Each supervisor makes one graceful attempt. Runs whose process exited
    /// become `cancelled`; the rest stay live with their pid persisted.
    pub async fn shutdown(&self) {
        let controls = self.ctx.runs.controls();
        info!(supervised = controls.len(), "Orchestrator shutting down");
        self.ctx.shutdown.cancel();
        for control in controls {
            control.finished().await;
        }
        info!("Orchestrator shut down");
    }

    /// Reconciler over this orchestrator's repositories and live run table
    pub fn reconciler(&self, config: ReconcilerConfig) -> Reconciler {
        Reconciler::new(config, self.ctx.clone())
    }

    pub async fn put_profile(&self, profile: Profile) -> Result<()> {
        profile.validate()?;
        self.ctx.repos.profiles.put_profile(profile).await
    }

    pub async fn get_profile(&self, id: &ProfileId) -> Result<Profile> {
        self.ctx
            .repos
            .profiles
            .get_profile(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("profile", id.as_str()))
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.ctx.repos.profiles.list_profiles().await
    }

    /// Register a task under an existing profile
    pub async fn create_task(&self, task: Task) -> Result<Task> {
        if self.ctx.repos.profiles.get_profile(&task.profile_id).await?.is_none() {
            return Err(OrchestratorError::InvalidInput(format!(
                "unknown profile '{}'",
                task.profile_id
            )));
        }
        self.ctx.repos.tasks.create_task(task.clone()).await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.ctx
            .repos
            .tasks
            .get_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("task", id.as_str()))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.ctx.repos.tasks.list_tasks().await
    }

    pub async fn get_run(&self, id: &RunId) -> Result<Run> {
        self.ctx
            .repos
            .runs
            .get_run(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.ctx.repos.runs.list_runs(filter).await
    }

    /// Stored events with `seq > since_seq`
    pub async fn events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>> {
        self.ctx.log.read(run_id, since_seq).await
    }

    pub async fn checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.ctx.repos.checkpoints.list_checkpoints(run_id).await
    }

    /// Live feed of one run, or of every run when `run_id` is `None`
    pub fn subscribe(&self, run_id: Option<RunId>) -> Subscription {
        self.ctx.broadcaster.subscribe(run_id)
    }

    pub fn broadcaster_stats(&self) -> BroadcasterStats {
        self.ctx.broadcaster.stats()
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.ctx.registry
    }

    /// Runs currently owned by a live task
    pub fn supervised_runs(&self) -> usize {
        self.ctx.runs.len()
    }

    fn reject(&self, reason: &str) {
        self.ctx
            .metrics
            .incr_counter(RUNS_REJECTED, &[("reason", reason.to_string())]);
    }

    /// `queued → starting → failed` for a run that never got a supervisor
    async fn fail_unlaunched(&self, run_id: &RunId, reason: &str) {
        let at = clock::now();
        let result = async {
            self.ctx
                .transition(run_id, RunStatus::Queued, RunStatus::Starting, &Transition::at(at))
                .await?;
            self.ctx
                .settle(
                    run_id,
                    RunStatus::Starting,
                    RunStatus::Failed,
                    &Transition::at(at).with_reason(reason),
                    json!({ "reason": reason }),
                )
                .await
        }
        .await;
        if let Err(e) = result {
            error!(run_id = %run_id, reason, error = %e, "Failed to settle unlaunched run");
        }
    }

    async fn replay(&self, record: IdempotencyRecord, request_fingerprint: &str) -> Result<Run> {
        if record.fingerprint != request_fingerprint {
            self.reject("idempotency_mismatch");
            return Err(OrchestratorError::InvalidInput(format!(
                "idempotency key '{}' was used for a different request",
                record.key
            )));
        }
        debug!(key = %record.key, run_id = %record.run_id, "Idempotent replay");
        self.get_run(&record.run_id).await
    }

    async fn validate(
        &self,
        request: &SubmitRequest,
    ) -> Result<(Profile, Task, Option<Checkpoint>)> {
        let repos = &self.ctx.repos;

        let profile = repos
            .profiles
            .get_profile(&request.profile_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::InvalidInput(format!("unknown profile '{}'", request.profile_id))
            })?;
        profile.validate()?;

        let task = repos.tasks.get_task(&request.task_id).await?.ok_or_else(|| {
            OrchestratorError::InvalidInput(format!("unknown task '{}'", request.task_id))
        })?;
        if task.profile_id != profile.id {
            return Err(OrchestratorError::InvalidInput(format!(
                "task {} belongs to profile {}, not {}",
                task.id, task.profile_id, profile.id
            )));
        }

        let resume_from = match (&request.parent_run_id, request.mode) {
            (Some(parent_id), _) => {
                let parent = repos.runs.get_run(parent_id).await?.ok_or_else(|| {
                    OrchestratorError::InvalidInput(format!("unknown parent run '{}'", parent_id))
                })?;
                if !parent.is_terminal() {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "parent run {} is still {}",
                        parent.id, parent.status
                    )));
                }
                if parent.task_id != task.id {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "parent run {} belongs to task {}",
                        parent.id, parent.task_id
                    )));
                }
                repos.checkpoints.latest_checkpoint(parent_id).await?
            }
            (None, RunMode::Continuation) => {
                return Err(OrchestratorError::InvalidInput(
                    "continuation requires a parent run".to_string(),
                ));
            }
            (None, _) => None,
        };

        Ok((profile, task, resume_from))
    }
}

/// Terminate an unsupervised run's process by pid and settle the run
async fn finish_detached_stop(ctx: &RuntimeContext, run: Run, from: RunStatus, reason: String) {
    let report = match run.pid {
        Some(pid) => ctx.terminator.terminate_pid(pid).await,
        None => TerminationReport {
            attempts: vec![],
            terminated: true,
            exit: None,
        },
    };

    let at = clock::now();
    let (to, transition, payload) = if !report.terminated {
        error!(run_id = %run.id, pid = ?run.pid, "Termination failed, process may be lingering");
        ctx.metrics.incr_counter(TERMINATION_FAILED, &[]);
        (
            RunStatus::Failed,
            Transition::at(at)
                .with_reason("termination_failed")
                .with_lingering_pid(run.pid),
            json!({
                "reason": "termination_failed",
                "stop_reason": reason,
                "termination": report.to_json(),
            }),
        )
    } else if from == RunStatus::Stopping {
        (
            RunStatus::Cancelled,
            Transition::at(at).with_reason(reason.clone()),
            json!({ "reason": reason, "termination": report.to_json() }),
        )
    } else {
        (
            RunStatus::Failed,
            Transition::at(at).with_reason(reason.clone()),
            json!({ "reason": reason, "stopped_before_activity": true, "termination": report.to_json() }),
        )
    };

    let mut from = from;
    if from == RunStatus::Queued {
        match ctx
            .transition(&run.id, RunStatus::Queued, RunStatus::Starting, &Transition::at(at))
            .await
        {
            Ok(true) => from = RunStatus::Starting,
            Ok(false) => return,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to stop queued run");
                return;
            }
        }
    }

    match ctx.settle(&run.id, from, to, &transition, payload).await {
        Ok(true) => {
            let mut settled = run;
            settled.status = to;
            ctx.release_detached(&settled).await;
        }
        Ok(false) => debug!(run_id = %run.id, "Detached stop lost to another transition"),
        Err(e) => error!(run_id = %run.id, error = %e, "Failed to settle detached stop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunnerKind;
    use crate::testing::{self, RecordingMetrics};

    fn orchestrator(max: usize) -> (Orchestrator, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::new());
        let orchestrator = Orchestrator::builder(Repositories::in_memory())
            .config(OrchestratorConfig {
                max_concurrent_runs: max,
                require_sandbox_by_default: false,
                append_retry: RetryPolicy::none(),
                ..Default::default()
            })
            .terminator(testing::fast_terminator())
            .metrics(metrics.clone())
            .build();
        (orchestrator, metrics)
    }

    async fn seed(orchestrator: &Orchestrator, script: &str, task: &str) {
        orchestrator
            .put_profile(Profile::new("P1", RunnerKind::Stub).with_model(script))
            .await
            .unwrap();
        orchestrator
            .create_task(Task::new(task, "P1", "do the thing", clock::now()))
            .await
            .unwrap();
    }

    #[test]
    fn test_fingerprint_covers_every_field() {
        let base = SubmitRequest::new("P1", "T1");
        assert_eq!(base.fingerprint(), SubmitRequest::new("P1", "T1").fingerprint());
        assert_ne!(
            base.fingerprint(),
            base.clone().with_mode(RunMode::Interactive).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            base.clone().with_parent(RunId::new("run_x")).fingerprint()
        );
        // the key itself is not part of the fingerprint
        assert_eq!(
            base.fingerprint(),
            base.clone().with_idempotency_key("k").fingerprint()
        );
    }

    #[tokio::test]
    async fn test_unknown_profile_is_invalid_input() {
        let (orchestrator, metrics) = orchestrator(2);
        let err = orchestrator
            .submit(SubmitRequest::new("nope", "T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
        assert_eq!(metrics.counter(RUNS_REJECTED), 1);
    }

    #[tokio::test]
    async fn test_task_must_belong_to_profile() {
        let (orchestrator, _) = orchestrator(2);
        seed(&orchestrator, "succeed", "T1").await;
        orchestrator
            .put_profile(Profile::new("P2", RunnerKind::Stub))
            .await
            .unwrap();

        let err = orchestrator
            .submit(SubmitRequest::new("P2", "T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_continuation_requires_terminal_parent() {
        let (orchestrator, _) = orchestrator(2);
        seed(&orchestrator, "sleep:10000", "T1").await;

        let err = orchestrator
            .submit(SubmitRequest::new("P1", "T1").with_mode(RunMode::Continuation))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        let parent = orchestrator.submit(SubmitRequest::new("P1", "T1")).await.unwrap();
        let err = orchestrator.resume(&parent.id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        orchestrator.stop(&parent.id, "test").await.unwrap();
        orchestrator.wait(&parent.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_replay_and_mismatch() {
        let (orchestrator, metrics) = orchestrator(4);
        seed(&orchestrator, "succeed", "T1").await;

        let request = SubmitRequest::new("P1", "T1").with_idempotency_key("k-1");
        let first = orchestrator.submit(request.clone()).await.unwrap();
        let second = orchestrator.submit(request.clone()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(metrics.counter(RUNS_SUBMITTED), 1);

        let err = orchestrator
            .submit(request.with_mode(RunMode::Interactive))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        let runs = orchestrator.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_run_is_not_found() {
        let (orchestrator, _) = orchestrator(1);
        let err = orchestrator
            .stop(&RunId::new("run_missing"), "user")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stop_terminal_run_reports_status() {
        let (orchestrator, _) = orchestrator(1);
        seed(&orchestrator, "succeed", "T1").await;

        let run = orchestrator.submit(SubmitRequest::new("P1", "T1")).await.unwrap();
        let done = orchestrator.wait(&run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let outcome = orchestrator.stop(&run.id, "user").await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyTerminal(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_active_gauge_tracks_permits() {
        let (orchestrator, metrics) = orchestrator(2);
        seed(&orchestrator, "sleep:10000", "T1").await;

        let run = orchestrator.submit(SubmitRequest::new("P1", "T1")).await.unwrap();
        assert_eq!(metrics.gauge(ACTIVE_RUNS), Some(1.0));

        orchestrator.stop(&run.id, "user").await.unwrap();
        orchestrator.wait(&run.id).await.unwrap();
        assert_eq!(metrics.gauge(ACTIVE_RUNS), Some(0.0));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let (orchestrator, _) = orchestrator(1);
        seed(&orchestrator, "succeed", "T1").await;
        orchestrator.shutdown().await;

        let err = orchestrator
            .submit(SubmitRequest::new("P1", "T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }
}
