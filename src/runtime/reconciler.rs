// src/runtime/reconciler.rs
//! Periodic reconciliation of stored run state with OS process reality
//!
//! Each pass:
//! - lists non-terminal runs and probes their pids with bounded concurrency
//! - orphans runs whose process is gone past the grace period
//! - re-touches quiet but live runs, up to a per-pass budget
//! - kills processes that outlived their terminal run, when enabled
//!
//! Status changes use the same CAS discipline as supervisors, so a pass that
//! races a supervisor never overrides a terminal state. Decisions are
//! announced through the broadcaster only; the run's own log gets
//! `run_orphaned` when a run is orphaned.

use crate::events::{Broadcast, Publisher, ReconcileAction, ReconcileNotice};
use crate::model::{Progress, Run, RunFilter, RunStatus, Transition};
use crate::observability::{
    RECONCILER_ORPHANED, RECONCILER_ORPHANS_KILLED, RECONCILER_PASS_DURATION,
    RECONCILER_STALE_RECOVERED,
};
use crate::runtime::orchestrator::RuntimeContext;
use crate::runtime::process_control::Signal;
use crate::runtime::run_table::StopReason;
use crate::utils::clock;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between passes
    pub interval: Duration,

    /// Idle time after which a live run is re-touched
    pub stale_threshold: Duration,

    /// Idle time after which a run with a dead process is orphaned
    pub orphan_grace: Duration,

    /// Re-touch budget per pass
    pub max_stale_runs: usize,

    /// Kill processes whose run ended without confirming their death
    pub kill_orphans: bool,

    pub auto_recover: bool,

    /// Runs inspected concurrently within a pass
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            orphan_grace: Duration::from_secs(300),
            max_stale_runs: 10,
            kill_orphans: true,
            auto_recover: true,
            concurrency: 8,
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub inspected: usize,
    pub orphaned: usize,
    pub stale_recovered: usize,

    /// Stale runs left alone because the budget ran out
    pub stale_skipped: usize,

    pub lingering_killed: usize,
    pub lingering_cleared: usize,
}

impl ReconcileReport {
    /// Nothing was changed
    pub fn is_noop(&self) -> bool {
        self.orphaned == 0
            && self.stale_recovered == 0
            && self.lingering_killed == 0
            && self.lingering_cleared == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Untouched,
    Orphaned,
    Recovered,
    StaleSkipped,
}

/// Reconciliation loop
pub struct Reconciler {
    config: ReconcilerConfig,
    ctx: Arc<RuntimeContext>,
}

impl Reconciler {
    pub(crate) fn new(config: ReconcilerConfig, ctx: Arc<RuntimeContext>) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let runs = self
            .ctx
            .repos
            .runs
            .list_runs(&RunFilter::non_terminal())
            .await?;
        let now = clock::now();
        let budget = AtomicUsize::new(self.config.max_stale_runs);

        let mut report = ReconcileReport {
            inspected: runs.len(),
            ..Default::default()
        };

        let decisions: Vec<Decision> = stream::iter(runs)
            .map(|run| self.reconcile_run(run, now, &budget))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for decision in decisions {
            match decision {
                Decision::Orphaned => report.orphaned += 1,
                Decision::Recovered => report.stale_recovered += 1,
                Decision::StaleSkipped => report.stale_skipped += 1,
                Decision::Untouched => {}
            }
        }

        if self.config.kill_orphans {
            self.kill_lingering(&mut report).await?;
        }

        let elapsed = started.elapsed();
        self.ctx.metrics.record_histogram(
            RECONCILER_PASS_DURATION,
            elapsed.as_secs_f64() * 1000.0,
            &[],
        );
        if report.is_noop() {
            debug!(inspected = report.inspected, "Reconcile pass found nothing to do");
        } else {
            info!(
                inspected = report.inspected,
                orphaned = report.orphaned,
                stale_recovered = report.stale_recovered,
                stale_skipped = report.stale_skipped,
                lingering_killed = report.lingering_killed,
                lingering_cleared = report.lingering_cleared,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reconcile pass complete"
            );
        }
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` is cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = self.config.interval.as_secs(), "Reconciler started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            error!(error = %e, "Reconcile pass failed");
                        }
                    }
                }
            }
            info!("Reconciler stopped");
        })
    }

    async fn reconcile_run(&self, run: Run, now: DateTime<Utc>, budget: &AtomicUsize) -> Decision {
        let supervised = self.ctx.runs.contains(&run.id);
        let eligible = match run.status {
            RunStatus::Running => true,
            RunStatus::Starting | RunStatus::Stopping => !supervised,
            _ => false,
        };
        if !eligible {
            return Decision::Untouched;
        }

        let idle = idle_for(&run, now);
        let alive = run
            .pid
            .is_some_and(|pid| self.ctx.process_control.is_alive(pid));

        if !alive {
            if idle < self.config.orphan_grace {
                debug!(run_id = %run.id, pid = ?run.pid, idle_ms = idle.as_millis() as u64, "Process gone, within grace");
                return Decision::Untouched;
            }
            return self.orphan(run, supervised, idle).await;
        }

        if !self.config.auto_recover || idle < self.config.stale_threshold {
            return Decision::Untouched;
        }
        if budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
        {
            debug!(run_id = %run.id, "Stale budget exhausted for this pass");
            return Decision::StaleSkipped;
        }
        self.recover(run, idle).await
    }

    async fn orphan(&self, run: Run, supervised: bool, idle: Duration) -> Decision {
        let transition = Transition::at(clock::now()).with_reason("process_gone");
        let payload = json!({
            "reason": "process_gone",
            "pid": run.pid,
            "previous_status": run.status.as_str(),
            "idle_ms": idle.as_millis() as u64,
        });

        match self
            .ctx
            .settle(&run.id, run.status, RunStatus::Orphaned, &transition, payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_id = %run.id, "Run moved on before it could be orphaned");
                return Decision::Untouched;
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to orphan run");
                return Decision::Untouched;
            }
        }

        warn!(run_id = %run.id, pid = ?run.pid, previous = %run.status, supervised, "Run orphaned");
        self.ctx.metrics.incr_counter(RECONCILER_ORPHANED, &[]);
        self.notify(&run, ReconcileAction::Orphaned, RunStatus::Orphaned, run.pid);

        match self.ctx.runs.get(&run.id) {
            Some(control) => {
                control.request_stop(StopReason::Orphaned);
            }
            None => {
                let mut settled = run;
                settled.status = RunStatus::Orphaned;
                self.ctx.release_detached(&settled).await;
            }
        }
        Decision::Orphaned
    }

    async fn recover(&self, run: Run, idle: Duration) -> Decision {
        match self
            .ctx
            .repos
            .runs
            .record_progress(&run.id, &Progress::touch(clock::now()))
            .await
        {
            Ok(true) => {
                info!(run_id = %run.id, pid = ?run.pid, idle_ms = idle.as_millis() as u64, "Stale run re-touched");
                self.ctx.metrics.incr_counter(RECONCILER_STALE_RECOVERED, &[]);
                self.notify(&run, ReconcileAction::StaleRecovered, run.status, run.pid);
                Decision::Recovered
            }
            Ok(false) => Decision::Untouched,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to re-touch stale run");
                Decision::Untouched
            }
        }
    }

    /// Kill processes recorded as lingering and forget the ones that are gone
    async fn kill_lingering(&self, report: &mut ReconcileReport) -> Result<()> {
        let lingering = self
            .ctx
            .repos
            .runs
            .list_runs(&RunFilter::lingering())
            .await?;

        for run in lingering {
            let Some(pid) = run.lingering_pid else {
                continue;
            };
            let control = &self.ctx.process_control;

            if control.is_alive(pid) {
                match control.signal(pid, Signal::Kill) {
                    Ok(()) => {
                        warn!(run_id = %run.id, pid, "Killed lingering process");
                        report.lingering_killed += 1;
                        self.ctx.metrics.incr_counter(RECONCILER_ORPHANS_KILLED, &[]);
                        self.notify(&run, ReconcileAction::LingeringKilled, run.status, Some(pid));
                    }
                    Err(e) => {
                        warn!(run_id = %run.id, pid, error = %e, "Failed to kill lingering process");
                    }
                }
            }

            if !control.is_alive(pid) {
                match self.ctx.repos.runs.clear_lingering_pid(&run.id).await {
                    Ok(true) => {
                        debug!(run_id = %run.id, pid, "Lingering pid cleared");
                        report.lingering_cleared += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(run_id = %run.id, error = %e, "Failed to clear lingering pid"),
                }
            }
        }
        Ok(())
    }

    fn notify(&self, run: &Run, action: ReconcileAction, status: RunStatus, pid: Option<u32>) {
        self.ctx
            .broadcaster
            .publish(Broadcast::Reconciliation(ReconcileNotice {
                run_id: run.id.clone(),
                action,
                status,
                pid,
                at: clock::now(),
            }));
    }
}

/// Time since the run last showed any sign of life
fn idle_for(run: &Run, now: DateTime<Utc>) -> Duration {
    let last = run
        .last_progress
        .or(run.started_at)
        .unwrap_or(run.created_at);
    (now - last).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, Profile, RunId, RunMode, RunnerKind, Task};
    use crate::runtime::orchestrator::{Orchestrator, OrchestratorConfig, SubmitRequest};
    use crate::runtime::process_control::SimulatedProcesses;
    use crate::storage::Repositories;
    use crate::testing::{self, RecordingMetrics};
    use crate::utils::retry::RetryPolicy;

    fn eager() -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(3600),
            orphan_grace: Duration::ZERO,
            max_stale_runs: 10,
            kill_orphans: true,
            auto_recover: true,
            concurrency: 4,
        }
    }

    fn orchestrator(
        repos: Repositories,
        processes: Arc<SimulatedProcesses>,
        metrics: Arc<RecordingMetrics>,
    ) -> Orchestrator {
        Orchestrator::builder(repos)
            .config(OrchestratorConfig {
                require_sandbox_by_default: false,
                append_retry: RetryPolicy::none(),
                ..Default::default()
            })
            .terminator(testing::fast_terminator())
            .processes(processes)
            .metrics(metrics)
            .build()
    }

    /// A run left behind by a previous control plane
    async fn stranded_running(repos: &Repositories, pid: Option<u32>, status: RunStatus) -> RunId {
        let now = clock::now();
        repos
            .profiles
            .put_profile(Profile::new("P1", RunnerKind::Stub))
            .await
            .unwrap();
        if repos.tasks.get_task(&"T1".into()).await.unwrap().is_none() {
            repos
                .tasks
                .create_task(Task::new("T1", "P1", "work", now))
                .await
                .unwrap();
        }

        let run = Run::queued(
            RunId::generate(),
            "P1".into(),
            "T1".into(),
            RunnerKind::Stub,
            RunMode::Batch,
            now,
        );
        let id = run.id.clone();
        repos.runs.create_run(run).await.unwrap();
        let step = Transition::at(now);
        repos
            .runs
            .compare_and_swap_status(&id, RunStatus::Queued, RunStatus::Starting, &step)
            .await
            .unwrap();
        repos.runs.set_pid(&id, pid).await.unwrap();
        if matches!(status, RunStatus::Running | RunStatus::Stopping) {
            repos
                .runs
                .compare_and_swap_status(&id, RunStatus::Starting, RunStatus::Running, &step)
                .await
                .unwrap();
        }
        if status == RunStatus::Stopping {
            repos
                .runs
                .compare_and_swap_status(&id, RunStatus::Running, RunStatus::Stopping, &step)
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_consistent_system_is_noop() {
        let repos = Repositories::in_memory();
        let processes = Arc::new(SimulatedProcesses::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let (pid, _exit) = processes.spawn(false);
        stranded_running(&repos, Some(pid), RunStatus::Running).await;

        let orchestrator = orchestrator(repos, processes, metrics.clone());
        let report = orchestrator.reconciler(eager()).reconcile_once().await.unwrap();

        assert_eq!(report.inspected, 1);
        assert!(report.is_noop());
        assert_eq!(metrics.counter(RECONCILER_ORPHANED), 0);
        assert_eq!(metrics.histogram_count(RECONCILER_PASS_DURATION), 1);
    }

    #[tokio::test]
    async fn test_dead_unsupervised_run_is_orphaned() {
        let repos = Repositories::in_memory();
        let processes = Arc::new(SimulatedProcesses::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let (pid, _exit) = processes.spawn(false);
        let id = stranded_running(&repos, Some(pid), RunStatus::Stopping).await;
        processes.kill_externally(pid);

        let orchestrator = orchestrator(repos, processes, metrics.clone());
        let mut feed = orchestrator.subscribe(Some(id.clone()));
        let report = orchestrator.reconciler(eager()).reconcile_once().await.unwrap();
        assert_eq!(report.orphaned, 1);

        let run = orchestrator.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Orphaned);
        assert_eq!(run.pid, None);
        assert_eq!(run.outcome_reason.as_deref(), Some("process_gone"));

        let events = orchestrator.events(&id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::RunOrphaned);

        let first = feed.recv().await.unwrap();
        assert_eq!(first.as_event().map(|e| e.kind), Some(EventKind::RunOrphaned));
        assert!(matches!(
            feed.recv().await.unwrap(),
            Broadcast::Reconciliation(ReconcileNotice {
                action: ReconcileAction::Orphaned,
                ..
            })
        ));
        assert_eq!(metrics.counter(RECONCILER_ORPHANED), 1);

        let task = orchestrator.get_task(&"T1".into()).await.unwrap();
        assert_eq!(task.status, crate::model::TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_orphan_waits_for_grace() {
        let repos = Repositories::in_memory();
        let processes = Arc::new(SimulatedProcesses::new());
        let id = stranded_running(&repos, None, RunStatus::Running).await;

        let orchestrator = orchestrator(repos, processes, Arc::new(RecordingMetrics::new()));
        let config = ReconcilerConfig {
            orphan_grace: Duration::from_secs(300),
            ..eager()
        };
        let report = orchestrator.reconciler(config).reconcile_once().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(
            orchestrator.get_run(&id).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_stale_runs_are_retouched_within_budget() {
        let repos = Repositories::in_memory();
        let processes = Arc::new(SimulatedProcesses::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (pid, _) = processes.spawn(false);
            ids.push(stranded_running(&repos, Some(pid), RunStatus::Running).await);
        }

        let orchestrator = orchestrator(repos, processes, metrics.clone());
        let config = ReconcilerConfig {
            stale_threshold: Duration::ZERO,
            max_stale_runs: 2,
            ..eager()
        };
        let report = orchestrator.reconciler(config).reconcile_once().await.unwrap();
        assert_eq!(report.stale_recovered, 2);
        assert_eq!(report.stale_skipped, 1);
        assert_eq!(report.orphaned, 0);
        assert_eq!(metrics.counter(RECONCILER_STALE_RECOVERED), 2);

        for id in ids {
            assert_eq!(
                orchestrator.get_run(&id).await.unwrap().status,
                RunStatus::Running
            );
        }
    }

    #[tokio::test]
    async fn test_supervised_live_run_is_left_alone() {
        let processes = Arc::new(SimulatedProcesses::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let orchestrator = orchestrator(Repositories::in_memory(), processes, metrics);
        orchestrator
            .put_profile(Profile::new("P1", RunnerKind::Stub).with_model("sleep:10000"))
            .await
            .unwrap();
        orchestrator
            .create_task(Task::new("T1", "P1", "work", clock::now()))
            .await
            .unwrap();

        let run = orchestrator
            .submit(SubmitRequest::new("P1", "T1"))
            .await
            .unwrap();
        testing::wait_for_status(&orchestrator, &run.id, RunStatus::Running).await;

        let report = orchestrator.reconciler(eager()).reconcile_once().await.unwrap();
        assert!(report.is_noop());

        orchestrator.stop(&run.id, "test").await.unwrap();
        orchestrator.wait(&run.id).await.unwrap();
    }

    #[test]
    fn test_idle_prefers_last_progress() {
        let now = clock::now();
        let mut run = Run::queued(
            RunId::generate(),
            "P1".into(),
            "T1".into(),
            RunnerKind::Stub,
            RunMode::Batch,
            now - chrono::Duration::seconds(60),
        );
        assert_eq!(idle_for(&run, now), Duration::from_secs(60));

        run.last_progress = Some(now - chrono::Duration::seconds(5));
        assert_eq!(idle_for(&run, now), Duration::from_secs(5));

        // clock skew never yields a negative idle time
        run.last_progress = Some(now + chrono::Duration::seconds(5));
        assert_eq!(idle_for(&run, now), Duration::ZERO);
    }
}
