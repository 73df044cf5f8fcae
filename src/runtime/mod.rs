// src/runtime/mod.rs
//! Run execution runtime
//!
//! This module drives runs from admission to a terminal state:
//!
//! - **Orchestrator**: admission control, idempotency, stop/resume entry points
//! - **Supervisor**: one task per run, draining runner events into the log
//! - **Terminator**: graceful → SIGTERM → SIGKILL escalation
//! - **Reconciler**: periodic orphan and stale-run detection
//! - **Run Table**: live supervisors and their stop signals
//! - **Process Control**: liveness probes and signal delivery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Orchestrator                        │
//! │   submit ─▶ admission (semaphore) ─▶ spawn supervisor    │
//! └───────────────┬──────────────────────────────┬───────────┘
//!                 │                              │
//!        ┌────────┴────────┐            ┌────────┴────────┐
//!        │  Supervisor(s)  │◀── stop ───│    Run Table    │
//!        │  runner events  │            └────────▲────────┘
//!        │  → event log    │                     │
//!        │  → checkpoints  │            ┌────────┴────────┐
//!        └────────┬────────┘            │   Reconciler    │
//!                 │                     │ pid probes, CAS │
//!        ┌────────┴────────┐            └─────────────────┘
//!        │   Terminator    │
//!        └─────────────────┘
//! ```

pub mod orchestrator;
pub mod process_control;
pub mod reconciler;
pub mod run_table;
mod supervisor;
pub mod terminator;

// Re-export commonly used types
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, StopOutcome, SubmitRequest,
};
pub use process_control::{
    HostProcessControl, NixProcessControl, ProcessControl, Signal, SimulatedProcesses,
};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use run_table::{RunControl, RunTable, StopReason};
pub use supervisor::SHUTDOWN_REASON;
pub use terminator::{TerminationAttempt, TerminationReport, Terminator, TerminatorConfig};
