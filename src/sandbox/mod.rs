// src/sandbox/mod.rs
//! Per-run isolated workspaces
//!
//! A sandbox is owned by exactly one run: acquired before launch, released on
//! every exit path (by the run's supervisor, or by the reconciler when the
//! supervisor is gone). Both calls may fail and are safe to retry.

pub mod local;

use crate::model::RunId;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub use local::LocalSandboxProvider;

/// Workspace provider
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Fresh workspace for `run_id`
    async fn acquire(&self, run_id: &RunId) -> Result<PathBuf>;

    /// Tear the workspace down; releasing twice is a programming error
    async fn release(&self, run_id: &RunId) -> Result<()>;
}
