// src/model/mod.rs
//! Domain model
//!
//! - **Run**: one execution of an agent, with its state machine
//! - **Task**: user-level unit of work that may have successive runs
//! - **Profile**: named runner configuration and limits
//! - **Checkpoint**: per-turn snapshot enabling resumption
//! - **Idempotency Record**: key → original run for retried submissions
//! - **Event**: append-only, sequence-numbered run history

pub mod checkpoint;
pub mod event;
pub mod idempotency;
pub mod ids;
pub mod profile;
pub mod run;
pub mod task;

pub use checkpoint::Checkpoint;
pub use event::{Event, EventKind, NewEvent};
pub use idempotency::IdempotencyRecord;
pub use ids::{ProfileId, RunId, TaskId};
pub use profile::{Profile, ProfileSet, RunnerKind};
pub use run::{Progress, Run, RunFilter, RunMode, RunOutcome, RunStatus, Transition, Usage};
pub use task::{Task, TaskStatus};
