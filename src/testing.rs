// src/testing.rs
//! Test helpers: recording metrics, fixtures and waiters
//!
//! Compiled for unit tests and behind the `test-support` feature for
//! integration tests.

use crate::events::{Broadcast, Subscription};
use crate::model::{Event, EventKind, Profile, Run, RunId, RunStatus, RunnerKind, Task};
use crate::observability::{Labels, MetricsRecorder};
use crate::runtime::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::runtime::process_control::SimulatedProcesses;
use crate::runtime::terminator::TerminatorConfig;
use crate::storage::Repositories;
use crate::utils::clock;
use crate::utils::retry::RetryPolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for every waiter below
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// One recorded counter increment
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSample {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
}

/// Metrics sink that remembers everything
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<Vec<CounterSample>>,
    histograms: Mutex<HashMap<&'static str, Vec<f64>>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total increments of `name`, across label sets
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .count() as u64
    }

    /// Increments of `name` carrying `label = value`
    pub fn counter_with(&self, name: &str, label: &str, value: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .filter(|s| s.labels.iter().any(|(k, v)| *k == label && v == value))
            .count() as u64
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    pub fn histogram_count(&self, name: &str) -> usize {
        self.histograms.lock().get(name).map_or(0, Vec::len)
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>) {
        self.counters.lock().push(CounterSample {
            name,
            labels: labels.to_vec(),
        });
    }

    fn record_histogram(&self, name: &'static str, value: f64, _labels: Labels<'_>) {
        self.histograms.lock().entry(name).or_default().push(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.gauges.lock().insert(name, value);
    }
}

/// Terminator windows short enough for tests
pub fn fast_terminator() -> TerminatorConfig {
    TerminatorConfig {
        graceful_timeout: Duration::from_millis(200),
        sigterm_grace: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    }
}

/// Stub profile playing `script` (see `StubBehavior`), without a sandbox
pub fn stub_profile(id: &str, script: &str) -> Profile {
    Profile::new(id, RunnerKind::Stub)
        .with_model(script)
        .with_sandbox(false)
}

/// Orchestrator over in-memory storage with stub runners
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub processes: Arc<SimulatedProcesses>,
    pub metrics: Arc<RecordingMetrics>,
    pub repos: Repositories,
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_repos(Repositories::in_memory(), config)
    }

    pub fn with_repos(repos: Repositories, config: OrchestratorConfig) -> Self {
        let processes = Arc::new(SimulatedProcesses::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let orchestrator = Orchestrator::builder(repos.clone())
            .config(config)
            .terminator(fast_terminator())
            .processes(processes.clone())
            .metrics(metrics.clone())
            .build();
        Self {
            orchestrator,
            processes,
            metrics,
            repos,
        }
    }

    /// Default limits, no sandbox, no retry delays
    pub fn config(max_concurrent_runs: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_runs,
            require_sandbox_by_default: false,
            append_retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    /// Register a stub profile and a task under it
    pub async fn seed(&self, profile: &str, script: &str, task: &str) {
        self.orchestrator
            .put_profile(stub_profile(profile, script))
            .await
            .expect("put profile");
        self.add_task(profile, task).await;
    }

    pub async fn add_task(&self, profile: &str, task: &str) {
        self.orchestrator
            .create_task(Task::new(task, profile, format!("prompt for {}", task), clock::now()))
            .await
            .expect("create task");
    }

    pub async fn kinds(&self, run_id: &RunId) -> Vec<EventKind> {
        event_kinds(&self.orchestrator.events(run_id, 0).await.expect("read events"))
    }
}

pub fn event_kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Poll until the run reaches `status`
pub async fn wait_for_status(orchestrator: &Orchestrator, run_id: &RunId, status: RunStatus) -> Run {
    let poll = async {
        loop {
            let run = orchestrator.get_run(run_id).await.expect("get run");
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT_LIMIT, poll)
        .await
        .unwrap_or_else(|_| panic!("run {} never reached {}", run_id, status))
}

/// Receive until an event of `kind` arrives; other messages are skipped
pub async fn wait_for_event(subscription: &mut Subscription, kind: EventKind) -> Event {
    let recv = async {
        loop {
            match subscription.recv().await {
                Some(Broadcast::Event(event)) if event.kind == kind => return event,
                Some(_) => continue,
                None => panic!("subscription closed before {}", kind.as_str()),
            }
        }
    };
    tokio::time::timeout(WAIT_LIMIT, recv)
        .await
        .unwrap_or_else(|_| panic!("no {} event within {:?}", kind.as_str(), WAIT_LIMIT))
}
