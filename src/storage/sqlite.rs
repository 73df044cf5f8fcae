// src/storage/sqlite.rs
//! Durable repositories on SQLite
//!
//! One connection behind an async mutex; every trait call is a single
//! transaction. Run mutations load the row, apply the same model methods the
//! in-memory store uses, and write the row back, so both stores share one
//! definition of the state machine.

use crate::model::{
    Checkpoint, Event, EventKind, IdempotencyRecord, NewEvent, Profile, ProfileId, Progress, Run,
    RunFilter, RunId, RunMode, RunOutcome, RunStatus, RunnerKind, Task, TaskId, TaskStatus,
    Transition, Usage,
};
use crate::storage::{
    next_event_timestamp, CheckpointRepository, EventRepository, IdempotencyRepository,
    ProfileRepository, RunRepository, TaskRepository,
};
use crate::utils::clock;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id            TEXT PRIMARY KEY,
    runner        TEXT NOT NULL,
    model         TEXT,
    max_turns     INTEGER,
    timeout_secs  INTEGER,
    allowed_tools TEXT NOT NULL,
    sandbox       INTEGER
);

CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    profile_id    TEXT NOT NULL,
    prompt        TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    latest_run_id TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id              TEXT PRIMARY KEY,
    profile_id      TEXT NOT NULL,
    task_id         TEXT NOT NULL,
    runner          TEXT NOT NULL,
    mode            TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    started_at      INTEGER,
    ended_at        INTEGER,
    turn            INTEGER NOT NULL,
    pid             INTEGER,
    last_progress   INTEGER,
    input_tokens    INTEGER NOT NULL,
    output_tokens   INTEGER NOT NULL,
    cost_usd        REAL NOT NULL,
    outcome         TEXT,
    outcome_reason  TEXT,
    parent_run_id   TEXT,
    idempotency_key TEXT,
    sandbox_path    TEXT,
    lingering_pid   INTEGER
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
CREATE INDEX IF NOT EXISTS idx_runs_lingering ON runs(lingering_pid) WHERE lingering_pid IS NOT NULL;

CREATE TABLE IF NOT EXISTS checkpoints (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL,
    turn       INTEGER NOT NULL,
    payload    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, turn, id);

CREATE TABLE IF NOT EXISTS idempotency (
    key         TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    run_id      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    run_id    TEXT NOT NULL,
    seq       INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    kind      TEXT NOT NULL,
    payload   TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
"#;

const RUN_COLUMNS: &str = "id, profile_id, task_id, runner, mode, status, created_at, started_at, \
     ended_at, turn, pid, last_progress, input_tokens, output_tokens, cost_usd, outcome, \
     outcome_reason, parent_run_id, idempotency_key, sandbox_path, lingering_pid";

/// SQLite store implementing every repository trait
pub struct SqliteStore {
    path: Option<PathBuf>,
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(&path).map_err(|e| {
            OrchestratorError::StorageFailed(format!("Failed to open database: {}", e))
        })?;
        let store = Self::from_connection(conn, Some(path))?;

        info!("SQLite store opened at {:?}", store.path);
        Ok(store)
    }

    /// Private in-memory database (tests, ephemeral deployments)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            OrchestratorError::StorageFailed(format!("Failed to open database: {}", e))
        })?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        if path.is_some() {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.execute_batch(SCHEMA).map_err(|e| {
            OrchestratorError::StorageFailed(format!("Schema creation failed: {}", e))
        })?;

        Ok(Self {
            path,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Load a run, let `f` mutate it, and write it back if `f` returns true
    async fn mutate_run(&self, id: &RunId, f: impl FnOnce(&mut Run) -> bool) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut run = load_run(&tx, id)?.ok_or_else(|| OrchestratorError::not_found("run", id.as_str()))?;
        if !f(&mut run) {
            return Ok(false);
        }
        save_run_state(&tx, &run)?;
        tx.commit()?;
        Ok(true)
    }
}

fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(ts)
}

fn bad_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), Type::Text)
}

/// `WHERE` clause and positional values for a run filter
fn run_filter_clause(filter: &RunFilter) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if !filter.statuses.is_empty() {
        let placeholders: Vec<String> = filter
            .statuses
            .iter()
            .map(|status| {
                values.push(SqlValue::Text(status.as_str().to_string()));
                format!("?{}", values.len())
            })
            .collect();
        conditions.push(format!("status IN ({})", placeholders.join(", ")));
    }
    if let Some(task_id) = &filter.task_id {
        values.push(SqlValue::Text(task_id.as_str().to_string()));
        conditions.push(format!("task_id = ?{}", values.len()));
    }
    if let Some(profile_id) = &filter.profile_id {
        values.push(SqlValue::Text(profile_id.as_str().to_string()));
        conditions.push(format!("profile_id = ?{}", values.len()));
    }
    if filter.lingering_only {
        conditions.push("lingering_pid IS NOT NULL".to_string());
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let runner: String = row.get(3)?;
    let mode: String = row.get(4)?;
    let status: String = row.get(5)?;
    let outcome: Option<String> = row.get(15)?;
    let sandbox_path: Option<String> = row.get(19)?;

    Ok(Run {
        id: RunId::new(row.get::<_, String>(0)?),
        profile_id: ProfileId::new(row.get::<_, String>(1)?),
        task_id: TaskId::new(row.get::<_, String>(2)?),
        runner: runner.parse::<RunnerKind>().map_err(|_| bad_column(3, "runner"))?,
        mode: RunMode::parse(&mode).ok_or_else(|| bad_column(4, "mode"))?,
        status: RunStatus::parse(&status).ok_or_else(|| bad_column(5, "status"))?,
        created_at: clock::from_millis(row.get(6)?),
        started_at: row.get::<_, Option<i64>>(7)?.map(clock::from_millis),
        ended_at: row.get::<_, Option<i64>>(8)?.map(clock::from_millis),
        turn: row.get::<_, i64>(9)? as u32,
        pid: row.get::<_, Option<i64>>(10)?.map(|p| p as u32),
        last_progress: row.get::<_, Option<i64>>(11)?.map(clock::from_millis),
        usage: Usage {
            input_tokens: row.get::<_, i64>(12)? as u64,
            output_tokens: row.get::<_, i64>(13)? as u64,
            cost_usd: row.get(14)?,
        },
        outcome: match outcome {
            Some(o) => Some(RunOutcome::parse(&o).ok_or_else(|| bad_column(15, "outcome"))?),
            None => None,
        },
        outcome_reason: row.get(16)?,
        parent_run_id: row.get::<_, Option<String>>(17)?.map(RunId::new),
        idempotency_key: row.get(18)?,
        sandbox_path: sandbox_path.map(PathBuf::from),
        lingering_pid: row.get::<_, Option<i64>>(20)?.map(|p| p as u32),
    })
}

fn load_run(tx: &Transaction<'_>, id: &RunId) -> Result<Option<Run>> {
    let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
    Ok(tx
        .query_row(&sql, params![id.as_str()], run_from_row)
        .optional()?)
}

fn save_run_state(tx: &Transaction<'_>, run: &Run) -> Result<()> {
    tx.execute(
        r#"
        UPDATE runs SET status = ?2, started_at = ?3, ended_at = ?4, turn = ?5, pid = ?6,
            last_progress = ?7, input_tokens = ?8, output_tokens = ?9, cost_usd = ?10,
            outcome = ?11, outcome_reason = ?12, sandbox_path = ?13, lingering_pid = ?14
        WHERE id = ?1
        "#,
        params![
            run.id.as_str(),
            run.status.as_str(),
            opt_ts(run.started_at),
            opt_ts(run.ended_at),
            run.turn as i64,
            run.pid.map(i64::from),
            opt_ts(run.last_progress),
            run.usage.input_tokens as i64,
            run.usage.output_tokens as i64,
            run.usage.cost_usd,
            run.outcome.map(|o| o.as_str()),
            run.outcome_reason,
            run.sandbox_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            run.lingering_pid.map(i64::from),
        ],
    )?;
    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    Ok(Task {
        id: TaskId::new(row.get::<_, String>(0)?),
        profile_id: ProfileId::new(row.get::<_, String>(1)?),
        prompt: row.get(2)?,
        status: TaskStatus::parse(&status).ok_or_else(|| bad_column(3, "status"))?,
        created_at: clock::from_millis(row.get(4)?),
        updated_at: clock::from_millis(row.get(5)?),
        latest_run_id: row.get::<_, Option<String>>(6)?.map(RunId::new),
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let runner: String = row.get(1)?;
    let tools: String = row.get(5)?;
    Ok(Profile {
        id: ProfileId::new(row.get::<_, String>(0)?),
        runner: runner.parse::<RunnerKind>().map_err(|_| bad_column(1, "runner"))?,
        model: row.get(2)?,
        max_turns: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
        timeout_secs: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        allowed_tools: serde_json::from_str(&tools).map_err(|_| bad_column(5, "allowed_tools"))?,
        sandbox: row.get(6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get(3)?;
    Ok(Event {
        run_id: RunId::new(row.get::<_, String>(0)?),
        seq: row.get::<_, i64>(1)? as u64,
        timestamp: clock::from_millis(row.get(2)?),
        kind: EventKind::parse(&kind).ok_or_else(|| bad_column(3, "kind"))?,
        payload: row.get(4)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        run_id: RunId::new(row.get::<_, String>(0)?),
        turn: row.get::<_, i64>(1)? as u32,
        payload: row.get(2)?,
        created_at: clock::from_millis(row.get(3)?),
    })
}

fn idempotency_from_row(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        key: row.get(0)?,
        fingerprint: row.get(1)?,
        run_id: RunId::new(row.get::<_, String>(2)?),
        created_at: clock::from_millis(row.get(3)?),
    })
}

#[async_trait]
impl ProfileRepository for SqliteStore {
    async fn put_profile(&self, profile: Profile) -> Result<()> {
        let tools = serde_json::to_string(&profile.allowed_tools)?;
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO profiles (id, runner, model, max_turns, timeout_secs, allowed_tools, sandbox)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET runner = excluded.runner, model = excluded.model,
                max_turns = excluded.max_turns, timeout_secs = excluded.timeout_secs,
                allowed_tools = excluded.allowed_tools, sandbox = excluded.sandbox
            "#,
            params![
                profile.id.as_str(),
                profile.runner.as_str(),
                profile.model,
                profile.max_turns.map(i64::from),
                profile.timeout_secs.map(|v| v as i64),
                tools,
                profile.sandbox,
            ],
        )?;
        Ok(())
    }

    async fn get_profile(&self, id: &ProfileId) -> Result<Option<Profile>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT id, runner, model, max_turns, timeout_secs, allowed_tools, sandbox FROM profiles WHERE id = ?1",
                params![id.as_str()],
                profile_from_row,
            )
            .optional()?)
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, runner, model, max_turns, timeout_secs, allowed_tools, sandbox FROM profiles ORDER BY id",
        )?;
        let profiles = stmt
            .query_map([], profile_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(profiles)
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        let db = self.db.lock().await;
        let inserted = db.execute(
            r#"
            INSERT OR IGNORE INTO tasks (id, profile_id, prompt, status, created_at, updated_at, latest_run_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                task.id.as_str(),
                task.profile_id.as_str(),
                task.prompt,
                task.status.as_str(),
                ts(task.created_at),
                ts(task.updated_at),
                task.latest_run_id.as_ref().map(|r| r.as_str()),
            ],
        )?;
        if inserted == 0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "task {} already exists",
                task.id
            )));
        }
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT id, profile_id, prompt, status, created_at, updated_at, latest_run_id FROM tasks WHERE id = ?1",
                params![id.as_str()],
                task_from_row,
            )
            .optional()?)
    }

    async fn update_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        latest_run: Option<&RunId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            r#"
            UPDATE tasks SET status = ?2, updated_at = MAX(updated_at, ?3),
                latest_run_id = COALESCE(?4, latest_run_id)
            WHERE id = ?1
            "#,
            params![
                id.as_str(),
                status.as_str(),
                ts(at),
                latest_run.map(|r| r.as_str())
            ],
        )?;
        Ok(updated > 0)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, profile_id, prompt, status, created_at, updated_at, latest_run_id FROM tasks ORDER BY created_at, id",
        )?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

#[async_trait]
impl RunRepository for SqliteStore {
    async fn create_run(&self, run: Run) -> Result<()> {
        let db = self.db.lock().await;
        let sql = format!(
            "INSERT OR IGNORE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            RUN_COLUMNS
        );
        let inserted = db.execute(
            &sql,
            params![
                run.id.as_str(),
                run.profile_id.as_str(),
                run.task_id.as_str(),
                run.runner.as_str(),
                run.mode.as_str(),
                run.status.as_str(),
                ts(run.created_at),
                opt_ts(run.started_at),
                opt_ts(run.ended_at),
                run.turn as i64,
                run.pid.map(i64::from),
                opt_ts(run.last_progress),
                run.usage.input_tokens as i64,
                run.usage.output_tokens as i64,
                run.usage.cost_usd,
                run.outcome.map(|o| o.as_str()),
                run.outcome_reason,
                run.parent_run_id.as_ref().map(|r| r.as_str()),
                run.idempotency_key,
                run.sandbox_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                run.lingering_pid.map(i64::from),
            ],
        )?;
        if inserted == 0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "run {} already exists",
                run.id
            )));
        }
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        Ok(db
            .query_row(&sql, params![id.as_str()], run_from_row)
            .optional()?)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let (clause, values) = run_filter_clause(filter);
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM runs{} ORDER BY created_at, id",
            RUN_COLUMNS, clause
        );
        let mut stmt = db.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(values), run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    async fn compare_and_swap_status(
        &self,
        id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        transition: &Transition,
    ) -> Result<bool> {
        self.mutate_run(id, |run| run.apply_transition(expected, next, transition))
            .await
    }

    async fn set_pid(&self, id: &RunId, pid: Option<u32>) -> Result<bool> {
        self.mutate_run(id, |run| {
            if run.is_terminal() {
                return false;
            }
            run.pid = pid;
            true
        })
        .await
    }

    async fn set_sandbox_path(&self, id: &RunId, path: &Path) -> Result<bool> {
        self.mutate_run(id, |run| {
            if run.is_terminal() {
                return false;
            }
            run.sandbox_path = Some(path.to_path_buf());
            true
        })
        .await
    }

    async fn record_progress(&self, id: &RunId, progress: &Progress) -> Result<bool> {
        self.mutate_run(id, |run| run.record_progress(progress)).await
    }

    async fn clear_lingering_pid(&self, id: &RunId) -> Result<bool> {
        self.mutate_run(id, |run| run.lingering_pid.take().is_some())
            .await
    }
}

#[async_trait]
impl CheckpointRepository for SqliteStore {
    async fn append_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO checkpoints (run_id, turn, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                checkpoint.run_id.as_str(),
                checkpoint.turn as i64,
                checkpoint.payload,
                ts(checkpoint.created_at),
            ],
        )?;
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT run_id, turn, payload, created_at FROM checkpoints WHERE run_id = ?1 ORDER BY turn DESC, id DESC LIMIT 1",
                params![run_id.as_str()],
                checkpoint_from_row,
            )
            .optional()?)
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id, turn, payload, created_at FROM checkpoints WHERE run_id = ?1 ORDER BY turn, id",
        )?;
        let checkpoints = stmt
            .query_map(params![run_id.as_str()], checkpoint_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(checkpoints)
    }
}

#[async_trait]
impl IdempotencyRepository for SqliteStore {
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT key, fingerprint, run_id, created_at FROM idempotency WHERE key = ?1",
                params![key],
                idempotency_from_row,
            )
            .optional()?)
    }

    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let existing = tx
            .query_row(
                "SELECT key, fingerprint, run_id, created_at FROM idempotency WHERE key = ?1",
                params![record.key],
                idempotency_from_row,
            )
            .optional()?;
        if existing.is_some() {
            return Ok(existing);
        }
        tx.execute(
            "INSERT INTO idempotency (key, fingerprint, run_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.key,
                record.fingerprint,
                record.run_id.as_str(),
                ts(record.created_at)
            ],
        )?;
        tx.commit()?;
        Ok(None)
    }
}

#[async_trait]
impl EventRepository for SqliteStore {
    async fn append_event(&self, run_id: &RunId, event: NewEvent) -> Result<Event> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let last: Option<(i64, i64, String)> = tx
            .query_row(
                "SELECT seq, timestamp, kind FROM events WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((_, _, kind)) = &last {
            if EventKind::parse(kind).is_some_and(|k| k.is_terminal()) {
                return Err(OrchestratorError::EventLogSealed(run_id.to_string()));
            }
        }

        let stored = Event {
            run_id: run_id.clone(),
            seq: last.as_ref().map_or(1, |(seq, _, _)| *seq as u64 + 1),
            timestamp: next_event_timestamp(
                event.timestamp,
                last.as_ref().map(|(_, t, _)| clock::from_millis(*t)),
            ),
            kind: event.kind,
            payload: event.payload,
        };

        tx.execute(
            "INSERT INTO events (run_id, seq, timestamp, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id.as_str(),
                stored.seq as i64,
                ts(stored.timestamp),
                stored.kind.as_str(),
                stored.payload,
            ],
        )?;
        tx.commit()?;
        Ok(stored)
    }

    async fn read_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id, seq, timestamp, kind, payload FROM events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let events = stmt
            .query_map(params![run_id.as_str(), since_seq as i64], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    async fn last_seq(&self, run_id: &RunId) -> Result<u64> {
        let db = self.db.lock().await;
        let seq: i64 = db.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1",
            params![run_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }
}
