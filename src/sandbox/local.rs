// src/sandbox/local.rs
//! Directory-per-run sandboxes on the local filesystem

use crate::model::RunId;
use crate::sandbox::SandboxProvider;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Released run ids remembered for double-release detection
const RELEASED_MEMORY: usize = 4096;

#[derive(Default)]
struct Ledger {
    held: HashSet<RunId>,
    released: HashSet<RunId>,

    /// Release order, oldest first; bounds `released`
    released_order: VecDeque<RunId>,
}

impl Ledger {
    fn remember_released(&mut self, run_id: &RunId, limit: usize) {
        if self.released.insert(run_id.clone()) {
            self.released_order.push_back(run_id.clone());
        }
        while self.released_order.len() > limit {
            if let Some(oldest) = self.released_order.pop_front() {
                self.released.remove(&oldest);
            }
        }
    }
}

/// Creates `<base_dir>/<run_id>` on acquire and removes it on release
pub struct LocalSandboxProvider {
    base_dir: PathBuf,
    ledger: Mutex<Ledger>,
    released_memory: usize,
}

impl LocalSandboxProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ledger: Mutex::new(Ledger::default()),
            released_memory: RELEASED_MEMORY,
        }
    }

    /// Cap on remembered releases (older ones are forgotten)
    pub fn with_released_memory(mut self, limit: usize) -> Self {
        self.released_memory = limit.max(1);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.base_dir.join(run_id.as_str())
    }

    pub fn held_count(&self) -> usize {
        self.ledger.lock().held.len()
    }

    pub fn remembered_releases(&self) -> usize {
        self.ledger.lock().released.len()
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn acquire(&self, run_id: &RunId) -> Result<PathBuf> {
        {
            let ledger = self.ledger.lock();
            if ledger.held.contains(run_id) || ledger.released.contains(run_id) {
                return Err(OrchestratorError::SandboxConflict(format!(
                    "sandbox for run {} was already acquired",
                    run_id
                )));
            }
        }

        let path = self.path_for(run_id);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            OrchestratorError::SandboxFailed(format!("Failed to create {:?}: {}", path, e))
        })?;

        self.ledger.lock().held.insert(run_id.clone());
        debug!(run_id = %run_id, path = ?path, "Sandbox acquired");
        Ok(path)
    }

    async fn release(&self, run_id: &RunId) -> Result<()> {
        let held = {
            let ledger = self.ledger.lock();
            if ledger.released.contains(run_id) {
                debug_assert!(false, "sandbox for run {} released twice", run_id);
                return Err(OrchestratorError::SandboxConflict(format!(
                    "sandbox for run {} released twice",
                    run_id
                )));
            }
            ledger.held.contains(run_id)
        };

        // not held here means the run predates this process; clean up what is left
        let path = self.path_for(run_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OrchestratorError::SandboxFailed(format!(
                    "Failed to remove {:?}: {}",
                    path, e
                )))
            }
        }

        let mut ledger = self.ledger.lock();
        ledger.held.remove(run_id);
        ledger.remember_released(run_id, self.released_memory);
        info!(run_id = %run_id, was_held = held, "Sandbox released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(dir.path());
        let run = RunId::new("r1");

        let path = provider.acquire(&run).await.unwrap();
        assert!(path.is_dir());
        assert_eq!(provider.held_count(), 1);

        provider.release(&run).await.unwrap();
        assert!(!path.exists());
        assert_eq!(provider.held_count(), 0);
    }

    #[tokio::test]
    async fn test_reacquire_rejected() {
        let dir = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(dir.path());
        let run = RunId::new("r1");
        provider.acquire(&run).await.unwrap();
        assert!(matches!(
            provider.acquire(&run).await,
            Err(OrchestratorError::SandboxConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_released_ids_are_forgotten_past_the_limit() {
        let dir = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(dir.path()).with_released_memory(2);
        for id in ["r1", "r2", "r3"] {
            let run = RunId::new(id);
            provider.acquire(&run).await.unwrap();
            provider.release(&run).await.unwrap();
        }
        assert_eq!(provider.remembered_releases(), 2);

        // r1 was forgotten, r3 is still guarded
        provider.acquire(&RunId::new("r1")).await.unwrap();
        assert!(matches!(
            provider.acquire(&RunId::new("r3")).await,
            Err(OrchestratorError::SandboxConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_release_after_restart_removes_leftovers() {
        let dir = tempdir().unwrap();
        let leftover = dir.path().join("r-old");
        std::fs::create_dir_all(leftover.join("src")).unwrap();

        let provider = LocalSandboxProvider::new(dir.path());
        provider.release(&RunId::new("r-old")).await.unwrap();
        assert!(!leftover.exists());
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "released twice")]
    async fn test_double_release_panics_in_debug() {
        let dir = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(dir.path());
        let run = RunId::new("r1");
        provider.acquire(&run).await.unwrap();
        provider.release(&run).await.unwrap();
        let _ = provider.release(&run).await;
    }
}
