// src/runtime/terminator.rs
//! Bounded graceful → SIGTERM → SIGKILL escalation
//!
//! Each step is delivered, then the process gets a grace window to go away.
//! A process that is already gone counts as terminated at any point. Every
//! attempt is recorded so the run's terminal event can carry the history.

use crate::runners::{ExitStatus, RunnerHandle, RunnerSignal};
use crate::runtime::process_control::ProcessControl;
use crate::utils::clock;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const FULL_ESCALATION: [RunnerSignal; 3] = [
    RunnerSignal::Graceful,
    RunnerSignal::Terminate,
    RunnerSignal::Kill,
];

/// Terminator timing
#[derive(Debug, Clone)]
pub struct TerminatorConfig {
    /// Wait after the cooperative request
    pub graceful_timeout: Duration,

    /// Wait after SIGTERM, and again after SIGKILL
    pub sigterm_grace: Duration,

    /// Liveness probe cadence while waiting
    pub poll_interval: Duration,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(10),
            sigterm_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// One escalation step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationAttempt {
    pub step: RunnerSignal,
    pub at: DateTime<Utc>,

    /// The process was gone by the end of this step's window
    pub exited: bool,

    /// Delivery error, if the signal could not be sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a termination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationReport {
    pub attempts: Vec<TerminationAttempt>,
    pub terminated: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
}

impl TerminationReport {
    pub fn graceful_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.step == RunnerSignal::Graceful)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// What is being terminated
#[derive(Clone, Copy)]
enum Target<'a> {
    /// A launched runner, signalled through its handle
    Handle(&'a dyn RunnerHandle),

    /// A bare pid with no handle (detached runs)
    Pid(u32),
}

impl Target<'_> {
    fn pid(&self) -> u32 {
        match self {
            Target::Handle(handle) => handle.pid(),
            Target::Pid(pid) => *pid,
        }
    }
}

/// Termination escalator
pub struct Terminator {
    config: TerminatorConfig,
    control: Arc<dyn ProcessControl>,
}

impl Terminator {
    pub fn new(config: TerminatorConfig, control: Arc<dyn ProcessControl>) -> Self {
        Self { config, control }
    }

    pub fn config(&self) -> &TerminatorConfig {
        &self.config
    }

    /// Full escalation through the runner's handle
    pub async fn terminate(&self, handle: &dyn RunnerHandle) -> TerminationReport {
        self.escalate(Target::Handle(handle), &FULL_ESCALATION).await
    }

    /// Full escalation with OS signals only
    pub async fn terminate_pid(&self, pid: u32) -> TerminationReport {
        self.escalate(Target::Pid(pid), &FULL_ESCALATION).await
    }

    /// One cooperative attempt, no escalation
    pub async fn graceful_only(&self, handle: &dyn RunnerHandle) -> TerminationReport {
        self.escalate(Target::Handle(handle), &[RunnerSignal::Graceful])
            .await
    }

    async fn escalate(&self, target: Target<'_>, steps: &[RunnerSignal]) -> TerminationReport {
        let pid = target.pid();
        let mut attempts = Vec::with_capacity(steps.len());

        for step in steps {
            if self.is_gone(target) {
                return self.report(target, attempts, true);
            }

            info!(pid, step = step.as_str(), "Termination step");
            let at = clock::now();
            let error = match target {
                Target::Handle(handle) => handle.terminate(*step).await,
                Target::Pid(pid) => self.control.signal(pid, step.os_signal()),
            }
            .err()
            .map(|e| e.to_string());
            if let Some(e) = &error {
                warn!(pid, step = step.as_str(), error = %e, "Failed to deliver termination signal");
            }

            let window = match step {
                RunnerSignal::Graceful => self.config.graceful_timeout,
                RunnerSignal::Terminate | RunnerSignal::Kill => self.config.sigterm_grace,
            };
            let exited = self.wait_gone(target, window).await;
            attempts.push(TerminationAttempt {
                step: *step,
                at,
                exited,
                error,
            });
            if exited {
                return self.report(target, attempts, true);
            }
        }

        warn!(pid, attempts = attempts.len(), "Process survived every termination step");
        self.report(target, attempts, false)
    }

    fn report(&self, target: Target<'_>, attempts: Vec<TerminationAttempt>, terminated: bool) -> TerminationReport {
        let exit = match target {
            Target::Handle(handle) if terminated => handle.wait().now_or_never(),
            _ => None,
        };
        TerminationReport {
            attempts,
            terminated,
            exit,
        }
    }

    fn is_gone(&self, target: Target<'_>) -> bool {
        if let Target::Handle(handle) = target {
            if handle.wait().now_or_never().is_some() {
                return true;
            }
        }
        !self.control.is_alive(target.pid())
    }

    async fn wait_gone(&self, target: Target<'_>, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        let poll = async {
            loop {
                if self.is_gone(target) {
                    return;
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        let exited = async {
            match target {
                Target::Handle(handle) => {
                    handle.wait().await;
                }
                Target::Pid(_) => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = exited => true,
            _ = poll => true,
            _ = tokio::time::sleep_until(deadline) => self.is_gone(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process_control::SimulatedProcesses;

    fn terminator(table: Arc<SimulatedProcesses>) -> Terminator {
        Terminator::new(
            TerminatorConfig {
                graceful_timeout: Duration::from_millis(100),
                sigterm_grace: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
            },
            table,
        )
    }

    #[tokio::test]
    async fn test_first_signal_terminates() {
        let table = Arc::new(SimulatedProcesses::new());
        let (pid, _exit) = table.spawn(false);

        let report = terminator(table.clone()).terminate_pid(pid).await;
        assert!(report.terminated);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.graceful_attempts(), 1);
        assert!(report.attempts[0].exited);
    }

    #[tokio::test]
    async fn test_every_step_times_out() {
        let table = Arc::new(SimulatedProcesses::new());
        let (pid, _exit) = table.spawn(true);

        let started = Instant::now();
        let report = terminator(table.clone()).terminate_pid(pid).await;
        assert!(!report.terminated);
        let steps: Vec<_> = report.attempts.iter().map(|a| a.step).collect();
        assert_eq!(
            steps,
            vec![RunnerSignal::Graceful, RunnerSignal::Terminate, RunnerSignal::Kill]
        );
        // bounded by the three windows
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(table.is_alive(pid));
    }

    #[tokio::test]
    async fn test_already_gone_is_success_without_attempts() {
        let table = Arc::new(SimulatedProcesses::new());
        let (pid, _exit) = table.spawn(false);
        table.exit(pid, ExitStatus::code(0));

        let report = terminator(table).terminate_pid(pid).await;
        assert!(report.terminated);
        assert!(report.attempts.is_empty());
    }

    #[test]
    fn test_report_serializes_attempts() {
        let report = TerminationReport {
            attempts: vec![TerminationAttempt {
                step: RunnerSignal::Graceful,
                at: clock::now(),
                exited: true,
                error: None,
            }],
            terminated: true,
            exit: None,
        };
        let json = report.to_json();
        assert_eq!(json["attempts"][0]["step"], "graceful");
        assert!(json.get("exit").is_none());
    }
}
