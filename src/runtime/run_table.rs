// src/runtime/run_table.rs
//! Live supervisors, keyed by run id
//!
//! The table only holds control handles; run state lives in the repositories.
//! Entries are inserted before a supervisor starts and removed as it exits.

use crate::model::RunId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a supervisor is asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Caller-initiated cancel
    Cancel { reason: String },

    /// Effective timeout elapsed
    Timeout,

    /// The reconciler already moved the run to `orphaned`
    Orphaned,
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::Cancel { reason } => reason,
            StopReason::Timeout => "timeout",
            StopReason::Orphaned => "orphaned",
        }
    }
}

/// Control handle shared between a supervisor and everyone who talks to it
#[derive(Debug)]
pub struct RunControl {
    run_id: RunId,
    stop: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    finished: CancellationToken,
}

impl RunControl {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            stop: CancellationToken::new(),
            reason: Mutex::new(None),
            finished: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Record a stop intent; the first one wins
    ///
    /// Returns true if this call's reason was recorded.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let recorded = {
            let mut current = self.reason.lock();
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        };
        self.stop.cancel();
        recorded
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.reason.lock().clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_orphaned(&self) -> bool {
        matches!(self.stop_reason(), Some(StopReason::Orphaned))
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn mark_finished(&self) {
        self.finished.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the owning task has exited
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

/// Run id → control handle
#[derive(Debug, Default)]
pub struct RunTable {
    runs: DashMap<RunId, Arc<RunControl>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control handle; `None` if the run is already owned
    pub fn insert(&self, run_id: &RunId) -> Option<Arc<RunControl>> {
        use dashmap::mapref::entry::Entry;

        match self.runs.entry(run_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let control = Arc::new(RunControl::new(run_id.clone()));
                slot.insert(control.clone());
                Some(control)
            }
        }
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunControl>> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn remove(&self, run_id: &RunId) {
        self.runs.remove(run_id);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Snapshot of every registered control handle
    pub fn controls(&self) -> Vec<Arc<RunControl>> {
        self.runs.iter().map(|entry| entry.value().clone()).collect()
    }
}
