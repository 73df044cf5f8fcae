// src/lib.rs
//! Agent Orchestrator Library
//!
//! Control plane for long-running AI coding agent runs: admission and
//! idempotency, per-run supervision of external agent processes, durable
//! event logs with live fan-out, bounded termination, and reconciliation of
//! stored state with the host's processes.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **model**: Runs, tasks, profiles, checkpoints, events and the run state machine
//! - **storage**: Repository traits with in-memory and SQLite implementations
//! - **events**: Durable event log and the subscriber broadcaster
//! - **runners**: Runner adapters (CLI agents, stub) and their registry
//! - **sandbox**: Per-run isolated workspaces
//! - **runtime**: Orchestrator, supervisors, terminator, reconciler
//! - **observability**: Tracing setup and injected metrics
//! - **utils**: Errors, configuration, retries, clock

// Public module exports
pub mod events;
pub mod model;
pub mod observability;
pub mod runners;
pub mod runtime;
pub mod sandbox;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export commonly used types
pub use model::{Profile, Run, RunMode, RunStatus, RunnerKind, Task};
pub use runtime::{
    Orchestrator, OrchestratorConfig, Reconciler, ReconcilerConfig, StopOutcome, SubmitRequest,
};
pub use storage::Repositories;
pub use utils::config::AppConfig;
pub use utils::errors::{OrchestratorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
