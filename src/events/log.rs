// src/events/log.rs
//! Durable run event log
//!
//! Appends go to the event repository first and are published only once
//! committed. Appends for one run are serialized so subscribers observe
//! each run's events in `seq` order.

use crate::events::broadcaster::{Broadcast, Publisher};
use crate::model::{Event, EventKind, NewEvent, RunId};
use crate::observability::{MetricsRecorder, EVENT_APPEND_FAILED};
use crate::storage::EventRepository;
use crate::utils::clock;
use crate::utils::errors::{OrchestratorError, Result};
use crate::utils::retry::RetryPolicy;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Event repository plus publisher, with retries
pub struct EventLog {
    repo: Arc<dyn EventRepository>,
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsRecorder>,
    ordering: DashMap<RunId, Arc<Mutex<()>>>,
}

impl EventLog {
    pub fn new(
        repo: Arc<dyn EventRepository>,
        publisher: Arc<dyn Publisher>,
        retry: RetryPolicy,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            repo,
            publisher,
            retry,
            metrics,
            ordering: DashMap::new(),
        }
    }

    /// Append and publish, absorbing failures
    ///
    /// Returns `None` when the append was abandoned (retries exhausted, or the
    /// log is already sealed). Callers still make their state transition.
    pub async fn append(&self, run_id: &RunId, kind: EventKind, payload: Value) -> Option<Event> {
        match self.try_append(run_id, kind, payload).await {
            Ok(event) => Some(event),
            Err(OrchestratorError::EventLogSealed(_)) => {
                debug!(run_id = %run_id, kind = kind.as_str(), "Event log sealed, append dropped");
                None
            }
            Err(e) => {
                error!(run_id = %run_id, kind = kind.as_str(), error = %e, "Event append failed");
                self.metrics
                    .incr_counter(EVENT_APPEND_FAILED, &[("kind", kind.as_str().to_string())]);
                self.publisher.publish(Broadcast::AppendFailed {
                    run_id: run_id.clone(),
                    kind,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Append and publish, returning the error to the caller
    pub async fn try_append(&self, run_id: &RunId, kind: EventKind, payload: Value) -> Result<Event> {
        let lock = self
            .ordering
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let event = NewEvent {
            kind,
            payload,
            timestamp: clock::now(),
        };
        let stored = match self
            .retry
            .run("event_append", || self.repo.append_event(run_id, event.clone()))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                if matches!(e, OrchestratorError::EventLogSealed(_)) {
                    self.ordering.remove(run_id);
                }
                return Err(e);
            }
        };

        self.publisher.publish(Broadcast::Event(stored.clone()));

        if kind.is_terminal() {
            self.ordering.remove(run_id);
        }
        Ok(stored)
    }

    /// Drop the append lock of a settled run
    ///
    /// Covers runs whose terminal append was abandoned.
    pub fn forget(&self, run_id: &RunId) {
        self.ordering.remove(run_id);
    }

    /// Runs currently holding an append lock
    pub fn tracked_runs(&self) -> usize {
        self.ordering.len()
    }

    /// Events with `seq > since_seq`, in order
    pub async fn read(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>> {
        self.repo.read_events(run_id, since_seq).await
    }

    pub async fn last_seq(&self, run_id: &RunId) -> Result<u64> {
        self.repo.last_seq(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::broadcaster::Broadcaster;
    use crate::observability::NoopMetrics;
    use crate::storage::memory::MemoryStore;
    use crate::testing::RecordingMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` appends with a transient error
    struct FlakyEvents {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventRepository for FlakyEvents {
        async fn append_event(&self, run_id: &RunId, event: NewEvent) -> Result<Event> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestratorError::TransientStorage("database is locked".into()));
            }
            self.inner.append_event(run_id, event).await
        }

        async fn read_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>> {
            self.inner.read_events(run_id, since_seq).await
        }

        async fn last_seq(&self, run_id: &RunId) -> Result<u64> {
            self.inner.last_seq(run_id).await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_append_publishes_after_commit() {
        let broadcaster = Arc::new(Broadcaster::default());
        let mut sub = broadcaster.subscribe(None);
        let log = EventLog::new(
            Arc::new(MemoryStore::new()),
            broadcaster.clone(),
            fast_retry(3),
            Arc::new(NoopMetrics),
        );
        let run = RunId::new("r1");

        let first = log.append(&run, EventKind::RunCreated, Value::Null).await.unwrap();
        assert_eq!(first.seq, 1);

        let received = sub.recv().await.unwrap();
        assert_eq!(received.as_event(), Some(&first));
        assert_eq!(log.last_seq(&run).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let repo = Arc::new(FlakyEvents {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let log = EventLog::new(repo, Arc::new(Broadcaster::default()), fast_retry(3), Arc::new(NoopMetrics));

        let event = log.append(&RunId::new("r1"), EventKind::RunCreated, Value::Null).await;
        assert_eq!(event.map(|e| e.seq), Some(1));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_append_failed() {
        let repo = Arc::new(FlakyEvents {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(10),
        });
        let broadcaster = Arc::new(Broadcaster::default());
        let mut sub = broadcaster.subscribe(None);
        let metrics = Arc::new(RecordingMetrics::default());
        let log = EventLog::new(repo, broadcaster.clone(), fast_retry(2), metrics.clone());

        let run = RunId::new("r1");
        assert!(log.append(&run, EventKind::RunStarted, Value::Null).await.is_none());
        assert_eq!(metrics.counter(EVENT_APPEND_FAILED), 1);

        match sub.recv().await.unwrap() {
            Broadcast::AppendFailed { run_id, kind, .. } => {
                assert_eq!(run_id, run);
                assert_eq!(kind, EventKind::RunStarted);
            }
            other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sealed_log_drops_quietly() {
        let metrics = Arc::new(RecordingMetrics::default());
        let log = EventLog::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Broadcaster::default()),
            fast_retry(3),
            metrics.clone(),
        );
        let run = RunId::new("r1");
        log.append(&run, EventKind::RunCompleted, Value::Null).await.unwrap();

        assert!(log.append(&run, EventKind::RunnerOutput, Value::Null).await.is_none());
        assert!(matches!(
            log.try_append(&run, EventKind::RunnerOutput, Value::Null).await,
            Err(OrchestratorError::EventLogSealed(_))
        ));
        assert_eq!(metrics.counter(EVENT_APPEND_FAILED), 0);
        assert_eq!(log.read(&run, 0).await.unwrap().len(), 1);
        assert_eq!(log.tracked_runs(), 0);
    }

    #[tokio::test]
    async fn test_append_locks_do_not_outlive_runs() {
        let repo = Arc::new(FlakyEvents {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(0),
        });
        let log = EventLog::new(repo.clone(), Arc::new(Broadcaster::default()), fast_retry(1), Arc::new(NoopMetrics));

        for i in 0..50 {
            let run = RunId::new(format!("r{}", i));
            log.append(&run, EventKind::RunCreated, Value::Null).await.unwrap();
            log.append(&run, EventKind::RunCompleted, Value::Null).await.unwrap();
        }
        assert_eq!(log.tracked_runs(), 0);

        // terminal append abandoned: the settle path forgets the run
        let run = RunId::new("lost");
        log.append(&run, EventKind::RunCreated, Value::Null).await.unwrap();
        repo.failures.store(5, Ordering::SeqCst);
        assert!(log.append(&run, EventKind::RunFailed, Value::Null).await.is_none());
        assert_eq!(log.tracked_runs(), 1);
        log.forget(&run);
        assert_eq!(log.tracked_runs(), 0);
    }
}
