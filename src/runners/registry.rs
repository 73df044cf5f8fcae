// src/runners/registry.rs
//! Runner kind → adapter table
//!
//! Adapters are probed once at startup (and on demand). A kind whose probe
//! fails, or that was never registered, resolves to an [`UnavailableRunner`]
//! so every launch produces a run with a recorded failure cause.

use crate::model::RunnerKind;
use crate::runners::cli::CliRunner;
use crate::runners::stub::{StubRunner, UnavailableRunner};
use crate::runners::RunnerAdapter;
use crate::runtime::process_control::SimulatedProcesses;
use crate::utils::config::RunnerSettings;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Probe result for one runner kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerAvailability {
    pub kind: RunnerKind,
    pub available: bool,
    pub reason: String,
}

/// Adapter table
pub struct RunnerRegistry {
    /// Registered adapters, before fallback substitution
    registered: HashMap<RunnerKind, Arc<dyn RunnerAdapter>>,

    /// What `resolve` hands out
    active: HashMap<RunnerKind, Arc<dyn RunnerAdapter>>,

    availability: HashMap<RunnerKind, RunnerAvailability>,

    /// Pid source for fallback adapters
    processes: Arc<SimulatedProcesses>,
}

impl RunnerRegistry {
    pub fn new(processes: Arc<SimulatedProcesses>) -> Self {
        Self {
            registered: HashMap::new(),
            active: HashMap::new(),
            availability: HashMap::new(),
            processes,
        }
    }

    /// CLI adapters for the configured binaries plus the stub
    pub fn from_settings(settings: &RunnerSettings, processes: Arc<SimulatedProcesses>) -> Self {
        let mut registry = Self::new(processes.clone());
        registry.register(Arc::new(CliRunner::claude_code(&settings.claude_code_binary)));
        registry.register(Arc::new(CliRunner::codex(&settings.codex_binary)));
        registry.register(Arc::new(CliRunner::opencode(&settings.opencode_binary)));
        registry.register(Arc::new(StubRunner::new(processes)));
        registry
    }

    /// Add (or replace) an adapter; it is used as-is until the next probe
    pub fn register(&mut self, adapter: Arc<dyn RunnerAdapter>) {
        let kind = adapter.kind();
        self.registered.insert(kind, adapter.clone());
        self.active.insert(kind, adapter);
        self.availability.remove(&kind);
    }

    /// Probe every registered adapter, swapping unavailable ones for the fallback
    pub async fn probe(&mut self) {
        for (kind, adapter) in &self.registered {
            let (available, reason) = adapter.is_available().await;
            if available {
                info!(runner = %kind, reason = %reason, "Runner available");
                self.active.insert(*kind, adapter.clone());
            } else {
                warn!(runner = %kind, reason = %reason, "Runner unavailable, using fallback");
                self.active.insert(
                    *kind,
                    Arc::new(UnavailableRunner::new(*kind, reason.clone(), self.processes.clone())),
                );
            }
            self.availability.insert(
                *kind,
                RunnerAvailability {
                    kind: *kind,
                    available,
                    reason,
                },
            );
        }
    }

    /// Adapter for `kind`; never fails
    pub fn resolve(&self, kind: RunnerKind) -> Arc<dyn RunnerAdapter> {
        match self.active.get(&kind) {
            Some(adapter) => adapter.clone(),
            None => Arc::new(UnavailableRunner::new(
                kind,
                format!("no adapter registered for {}", kind),
                self.processes.clone(),
            )),
        }
    }

    /// Last probe results, in `RunnerKind::ALL` order; unprobed kinds are omitted
    pub fn availability(&self) -> Vec<RunnerAvailability> {
        RunnerKind::ALL
            .iter()
            .filter_map(|kind| self.availability.get(kind).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Profile, RunId, RunMode, Task};
    use crate::runners::{LaunchParams, RunnerEventKind};
    use crate::utils::clock;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_missing_binaries_fall_back() {
        let processes = Arc::new(SimulatedProcesses::new());
        let settings = RunnerSettings {
            claude_code_binary: "no-such-claude-binary".into(),
            codex_binary: "no-such-codex-binary".into(),
            opencode_binary: "no-such-opencode-binary".into(),
        };
        let mut registry = RunnerRegistry::from_settings(&settings, processes);
        registry.probe().await;

        let availability = registry.availability();
        assert_eq!(availability.len(), 4);
        assert!(availability
            .iter()
            .all(|a| a.available == (a.kind == RunnerKind::Stub)));

        let adapter = registry.resolve(RunnerKind::Codex);
        assert!(!adapter.is_available().await.0);

        let params = LaunchParams {
            run_id: RunId::new("r1"),
            mode: RunMode::Batch,
            profile: Profile::new("P1", RunnerKind::Codex),
            task: Task::new("T1", "P1", "hi", clock::now()),
            sandbox_path: None,
            resume_from: None,
            cancel: CancellationToken::new(),
        };
        let mut handle = adapter.launch(params).await.unwrap();
        let first = handle.events().next().await.unwrap();
        assert_eq!(first.kind, RunnerEventKind::Failure);
    }

    #[tokio::test]
    async fn test_unregistered_kind_resolves_to_fallback() {
        let registry = RunnerRegistry::new(Arc::new(SimulatedProcesses::new()));
        let adapter = registry.resolve(RunnerKind::OpenCode);
        let (available, reason) = adapter.is_available().await;
        assert!(!available);
        assert!(reason.contains("no adapter registered"));
        assert!(registry.availability().is_empty());
    }
}
