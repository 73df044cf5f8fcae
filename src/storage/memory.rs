// src/storage/memory.rs
//! In-process repositories
//!
//! Each entity map sits behind its own `RwLock`; locks are held only for
//! the duration of a map operation and never across an await point.

use crate::model::{
    Checkpoint, Event, IdempotencyRecord, NewEvent, Profile, ProfileId, Progress, Run, RunFilter,
    RunId, RunStatus, Task, TaskId, TaskStatus, Transition,
};
use crate::storage::{
    next_event_timestamp, CheckpointRepository, EventRepository, IdempotencyRepository,
    ProfileRepository, RunRepository, TaskRepository,
};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// In-memory store implementing every repository trait
#[derive(Default)]
pub struct MemoryStore {
    profiles: RwLock<HashMap<ProfileId, Profile>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    runs: RwLock<HashMap<RunId, Run>>,
    checkpoints: RwLock<HashMap<RunId, Vec<Checkpoint>>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_run(&self, id: &RunId, f: impl FnOnce(&mut Run)) -> Result<bool> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))?;
        if run.is_terminal() {
            return Ok(false);
        }
        f(run);
        Ok(true)
    }
}

#[async_trait]
impl ProfileRepository for MemoryStore {
    async fn put_profile(&self, profile: Profile) -> Result<()> {
        self.profiles.write().insert(profile.id.clone(), profile);
        Ok(())
    }

    async fn get_profile(&self, id: &ProfileId) -> Result<Option<Profile>> {
        Ok(self.profiles.read().get(id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let mut profiles: Vec<_> = self.profiles.read().values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn update_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        latest_run: Option<&RunId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };
        task.status = status;
        task.updated_at = at.max(task.updated_at);
        if let Some(run_id) = latest_run {
            task.latest_run_id = Some(run_id.clone());
        }
        Ok(true)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(tasks)
    }
}

#[async_trait]
impl RunRepository for MemoryStore {
    async fn create_run(&self, run: Run) -> Result<()> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "run {} already exists",
                run.id
            )));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(runs)
    }

    async fn compare_and_swap_status(
        &self,
        id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        transition: &Transition,
    ) -> Result<bool> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))?;
        Ok(run.apply_transition(expected, next, transition))
    }

    async fn set_pid(&self, id: &RunId, pid: Option<u32>) -> Result<bool> {
        self.with_live_run(id, |run| run.pid = pid)
    }

    async fn set_sandbox_path(&self, id: &RunId, path: &Path) -> Result<bool> {
        self.with_live_run(id, |run| run.sandbox_path = Some(path.to_path_buf()))
    }

    async fn record_progress(&self, id: &RunId, progress: &Progress) -> Result<bool> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))?;
        Ok(run.record_progress(progress))
    }

    async fn clear_lingering_pid(&self, id: &RunId) -> Result<bool> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))?;
        Ok(run.lingering_pid.take().is_some())
    }
}

#[async_trait]
impl CheckpointRepository for MemoryStore {
    async fn append_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write();
        let series = checkpoints.entry(checkpoint.run_id.clone()).or_default();
        // stable insert keeps write order within a turn
        let pos = series.partition_point(|c| c.turn <= checkpoint.turn);
        series.insert(pos, checkpoint);
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(run_id)
            .and_then(|series| series.last().cloned()))
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.idempotency.read().get(key).cloned())
    }

    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        let mut records = self.idempotency.write();
        if let Some(existing) = records.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        records.insert(record.key.clone(), record);
        Ok(None)
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append_event(&self, run_id: &RunId, event: NewEvent) -> Result<Event> {
        let mut events = self.events.write();
        let log = events.entry(run_id.clone()).or_default();
        let last = log.last();
        if last.is_some_and(|e| e.kind.is_terminal()) {
            return Err(OrchestratorError::EventLogSealed(run_id.to_string()));
        }

        let stored = Event {
            run_id: run_id.clone(),
            seq: last.map_or(1, |e| e.seq + 1),
            timestamp: next_event_timestamp(event.timestamp, last.map(|e| e.timestamp)),
            kind: event.kind,
            payload: event.payload,
        };
        log.push(stored.clone());
        Ok(stored)
    }

    async fn read_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .get(run_id)
            .map(|log| {
                // seq n lives at index n - 1
                let start = (since_seq as usize).min(log.len());
                log[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn last_seq(&self, run_id: &RunId) -> Result<u64> {
        Ok(self
            .events
            .read()
            .get(run_id)
            .and_then(|log| log.last().map(|e| e.seq))
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, RunMode, RunnerKind};
    use crate::utils::clock;

    fn run(id: &str) -> Run {
        Run::queued(
            RunId::new(id),
            ProfileId::new("P1"),
            TaskId::new("T1"),
            RunnerKind::Stub,
            RunMode::Batch,
            clock::now(),
        )
    }

    fn new_event(kind: EventKind) -> NewEvent {
        NewEvent {
            kind,
            payload: serde_json::json!({}),
            timestamp: clock::now(),
        }
    }

    #[tokio::test]
    async fn test_cas_single_winner() {
        let store = MemoryStore::new();
        store.create_run(run("r1")).await.unwrap();
        let id = RunId::new("r1");
        let t = Transition::at(clock::now());

        assert!(store
            .compare_and_swap_status(&id, RunStatus::Queued, RunStatus::Starting, &t)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap_status(&id, RunStatus::Queued, RunStatus::Starting, &t)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cas_unknown_run_errors() {
        let store = MemoryStore::new();
        let result = store
            .compare_and_swap_status(
                &RunId::new("nope"),
                RunStatus::Queued,
                RunStatus::Starting,
                &Transition::at(clock::now()),
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_event_log_is_gap_free_and_sealed() {
        let store = MemoryStore::new();
        let id = RunId::new("r1");

        for kind in [EventKind::RunCreated, EventKind::RunStarted, EventKind::RunCompleted] {
            store.append_event(&id, new_event(kind)).await.unwrap();
        }
        let sealed = store.append_event(&id, new_event(EventKind::Progress)).await;
        assert!(matches!(sealed, Err(OrchestratorError::EventLogSealed(_))));

        let events = store.read_events(&id, 0).await.unwrap();
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.read_events(&id, 2).await.unwrap().len(), 1);
        assert_eq!(store.last_seq(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        let record = IdempotencyRecord {
            key: "k-1".into(),
            fingerprint: "F".into(),
            run_id: RunId::new("r1"),
            created_at: clock::now(),
        };
        assert!(store.put_if_absent(record.clone()).await.unwrap().is_none());

        let second = IdempotencyRecord {
            run_id: RunId::new("r2"),
            ..record.clone()
        };
        let existing = store.put_if_absent(second).await.unwrap().unwrap();
        assert_eq!(existing.run_id, RunId::new("r1"));
    }

    #[tokio::test]
    async fn test_checkpoints_ordered_by_turn() {
        let store = MemoryStore::new();
        let id = RunId::new("r1");
        for turn in [2, 1, 3] {
            store
                .append_checkpoint(Checkpoint {
                    run_id: id.clone(),
                    turn,
                    payload: serde_json::json!({ "turn": turn }),
                    created_at: clock::now(),
                })
                .await
                .unwrap();
        }
        let turns: Vec<_> = store
            .list_checkpoints(&id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.turn)
            .collect();
        assert_eq!(turns, vec![1, 2, 3]);
        assert_eq!(store.latest_checkpoint(&id).await.unwrap().unwrap().turn, 3);
    }
}
