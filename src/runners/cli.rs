// src/runners/cli.rs
//! Agent CLIs run as child processes
//!
//! stdout is framed into lines and parsed per [`Dialect`]; stderr is logged
//! at debug level. A background task owns the child and publishes its exit
//! status, so `wait` can be awaited from any number of places.

use crate::model::RunnerKind;
use crate::runners::dialect::{Dialect, LineParser};
use crate::runners::{
    ExitStatus, LaunchParams, RunnerAdapter, RunnerEvent, RunnerHandle, RunnerSignal,
};
use crate::runtime::process_control::{NixProcessControl, ProcessControl};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use futures::future::ready;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Longest stdout line accepted from an agent
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Environment variable carrying the run id into the agent process
pub const RUN_ID_ENV: &str = "AGENT_ORCH_RUN_ID";

/// Adapter for one agent CLI
pub struct CliRunner {
    dialect: Dialect,
    binary: String,
}

impl CliRunner {
    pub fn new(dialect: Dialect, binary: impl Into<String>) -> Self {
        Self {
            dialect,
            binary: binary.into(),
        }
    }

    pub fn claude_code(binary: impl Into<String>) -> Self {
        Self::new(Dialect::ClaudeCode, binary)
    }

    pub fn codex(binary: impl Into<String>) -> Self {
        Self::new(Dialect::Codex, binary)
    }

    pub fn opencode(binary: impl Into<String>) -> Self {
        Self::new(Dialect::OpenCode, binary)
    }
}

#[async_trait]
impl RunnerAdapter for CliRunner {
    fn kind(&self) -> RunnerKind {
        self.dialect.kind()
    }

    async fn is_available(&self) -> (bool, String) {
        match which::which(&self.binary) {
            Ok(path) => (true, format!("found at {}", path.display())),
            Err(e) => (
                false,
                format!("executable '{}' not found in PATH: {}", self.binary, e),
            ),
        }
    }

    async fn launch(&self, params: LaunchParams) -> Result<Box<dyn RunnerHandle>> {
        if params.cancel.is_cancelled() {
            return Err(OrchestratorError::LaunchFailed("launch cancelled".to_string()));
        }

        let program = which::which(&self.binary).map_err(|e| OrchestratorError::RunnerUnavailable {
            kind: self.dialect.kind().to_string(),
            reason: format!("executable '{}' not found in PATH: {}", self.binary, e),
        })?;

        let mut command = Command::new(&program);
        command
            .args(self.dialect.args(&params))
            .env(RUN_ID_ENV, params.run_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &params.sandbox_path {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::LaunchFailed(format!("Failed to spawn {:?}: {}", program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| OrchestratorError::LaunchFailed("process exited before reporting a pid".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::LaunchFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::LaunchFailed("failed to capture stderr".into()))?;

        info!(run_id = %params.run_id, pid, runner = %self.dialect.kind(), "Runner process spawned");

        let run_id = params.run_id.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(Ok(line)) = lines.next().await {
                debug!(run_id = %run_id, "runner stderr: {}", line);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from_std(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed waiting for runner process");
                    ExitStatus::default()
                }
            };
            exit_tx.send_replace(Some(status));
        });

        let run_id = params.run_id.clone();
        let mut parser = LineParser::new(self.dialect);
        let events = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
            .filter_map(move |line| {
                ready(match line {
                    Ok(line) => Some(line),
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Dropping unreadable runner output");
                        None
                    }
                })
            })
            .flat_map(move |line| stream::iter(parser.parse(&line)))
            .boxed();

        Ok(Box::new(ChildHandle {
            pid,
            exit: exit_rx,
            events: Mutex::new(Some(events)),
        }))
    }
}

struct ChildHandle {
    pid: u32,
    exit: watch::Receiver<Option<ExitStatus>>,
    events: Mutex<Option<BoxStream<'static, RunnerEvent>>>,
}

#[async_trait]
impl RunnerHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn events(&mut self) -> BoxStream<'static, RunnerEvent> {
        self.events
            .get_mut()
            .take()
            .unwrap_or_else(|| stream::empty().boxed())
    }

    async fn terminate(&self, signal: RunnerSignal) -> Result<()> {
        // reaped pids may already belong to someone else
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        NixProcessControl.signal(self.pid, signal.os_signal())
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).unwrap_or_default(),
            Err(_) => ExitStatus::default(),
        };
        status
    }
}
