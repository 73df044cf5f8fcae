// src/storage/mod.rs
//! Repositories
//!
//! Persistence is reached only through the narrow traits below. The core
//! depends on their semantics, not on a storage engine:
//!
//! - atomic compare-and-swap on run status
//! - gap-free, per-run ordered event insertion (sealed after the terminal event)
//! - at most one record per idempotency key
//!
//! Two interchangeable implementations exist: [`memory::MemoryStore`] for
//! single-node use and tests, and [`sqlite::SqliteStore`] for durability.
//! Both run through the same property tests.

pub mod memory;
pub mod sqlite;

use crate::model::{
    Checkpoint, Event, IdempotencyRecord, NewEvent, Profile, ProfileId, Progress, Run, RunFilter,
    RunId, RunStatus, Task, TaskId, TaskStatus, Transition,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    /// Create or replace a profile
    async fn put_profile(&self, profile: Profile) -> Result<()>;

    async fn get_profile(&self, id: &ProfileId) -> Result<Option<Profile>>;

    async fn list_profiles(&self) -> Result<Vec<Profile>>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task; fails with `InvalidInput` if the id exists
    async fn create_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Set status (and latest run when given); `false` if the task is unknown
    async fn update_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        latest_run: Option<&RunId>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<()>;

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    /// Runs matching the filter, oldest first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Atomically move `expected → next`; `false` when another path won
    async fn compare_and_swap_status(
        &self,
        id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        transition: &Transition,
    ) -> Result<bool>;

    /// Record the OS pid of a non-terminal run
    async fn set_pid(&self, id: &RunId, pid: Option<u32>) -> Result<bool>;

    /// Record the sandbox allocated to a non-terminal run
    async fn set_sandbox_path(&self, id: &RunId, path: &Path) -> Result<bool>;

    /// Touch `last_progress`, advance the turn counter, add usage
    async fn record_progress(&self, id: &RunId, progress: &Progress) -> Result<bool>;

    /// Forget a lingering pid once its process is gone
    async fn clear_lingering_pid(&self, id: &RunId) -> Result<bool>;
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn append_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Highest-turn checkpoint (latest written wins on ties)
    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>>;

    /// All checkpoints ordered by turn
    async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>>;
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Insert unless the key exists; returns the existing record if it does
    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Assign the next gap-free sequence number and persist atomically
    ///
    /// Fails with `EventLogSealed` once the run's terminal event is stored.
    async fn append_event(&self, run_id: &RunId, event: NewEvent) -> Result<Event>;

    /// Events with `seq > since_seq`, in order
    async fn read_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>>;

    /// Highest assigned sequence number (0 for an empty log)
    async fn last_seq(&self, run_id: &RunId) -> Result<u64>;
}

/// Every repository, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub profiles: Arc<dyn ProfileRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub events: Arc<dyn EventRepository>,
}

impl Repositories {
    /// Use one store for every entity kind
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ProfileRepository
            + TaskRepository
            + RunRepository
            + CheckpointRepository
            + IdempotencyRepository
            + EventRepository
            + 'static,
    {
        Self {
            profiles: store.clone(),
            tasks: store.clone(),
            runs: store.clone(),
            checkpoints: store.clone(),
            idempotency: store.clone(),
            events: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()))
    }

    pub async fn sqlite(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::from_store(Arc::new(SqliteStore::open(path).await?)))
    }
}

/// Timestamp for the next event: never earlier than the previous one
pub(crate) fn next_event_timestamp(
    requested: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    previous.map_or(requested, |p| requested.max(p))
}
