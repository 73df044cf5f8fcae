// src/runtime/process_control.rs
//! Process liveness probes and signal delivery
//!
//! Implementations:
//! - **NixProcessControl**: real host processes via `kill(2)`
//! - **SimulatedProcesses**: in-memory pid table used by stub runners and tests
//! - **HostProcessControl**: routes the simulated pid range to the table and
//!   everything else to the host

use crate::runners::ExitStatus;
use crate::utils::errors::{OrchestratorError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// First pid handed out by [`SimulatedProcesses`]; above any Linux `pid_max`
pub const SIMULATED_PID_BASE: u32 = 5_000_000;

/// Signals the control plane sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    pub fn number(&self) -> i32 {
        self.to_nix() as i32
    }

    fn to_nix(self) -> nix::sys::signal::Signal {
        match self {
            Signal::Interrupt => nix::sys::signal::Signal::SIGINT,
            Signal::Terminate => nix::sys::signal::Signal::SIGTERM,
            Signal::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

/// Probe and signal processes by pid
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver `signal`; a pid that no longer exists is not an error
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // 0 and negative values address process groups
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Host processes
#[derive(Debug, Default, Clone, Copy)]
pub struct NixProcessControl;

impl ProcessControl for NixProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        match to_nix_pid(pid) {
            Some(pid) => matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)),
            None => false,
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Some(nix_pid) = to_nix_pid(pid) else {
            return Err(OrchestratorError::InvalidInput(format!("invalid pid {}", pid)));
        };

        debug!("Sending {:?} to PID {}", signal, pid);
        match kill(nix_pid, signal.to_nix()) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(OrchestratorError::TerminationFailed {
                run_id: String::new(),
                reason: format!("Failed to send {:?} to {}: {}", signal, pid, e),
            }),
        }
    }
}

struct SimulatedProcess {
    ignore_signals: bool,
    exit: watch::Sender<Option<ExitStatus>>,
}

/// In-memory process table
///
/// A simulated process lives until it exits on its own, is signalled (unless
/// it ignores signals), or is killed externally.
pub struct SimulatedProcesses {
    next_pid: AtomicU32,
    table: Mutex<HashMap<u32, SimulatedProcess>>,

    /// Exit channels of externally killed processes; nobody is ever told
    vanished: Mutex<Vec<watch::Sender<Option<ExitStatus>>>>,
}

impl SimulatedProcesses {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(SIMULATED_PID_BASE),
            table: Mutex::new(HashMap::new()),
            vanished: Mutex::new(Vec::new()),
        }
    }

    pub fn is_simulated(pid: u32) -> bool {
        pid >= SIMULATED_PID_BASE
    }

    /// Start a process; the receiver resolves to its exit status
    pub fn spawn(&self, ignore_signals: bool) -> (u32, watch::Receiver<Option<ExitStatus>>) {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (exit, receiver) = watch::channel(None);
        self.table.lock().insert(
            pid,
            SimulatedProcess {
                ignore_signals,
                exit,
            },
        );
        (pid, receiver)
    }

    /// The process exits with `status`; false if it was already gone
    pub fn exit(&self, pid: u32, status: ExitStatus) -> bool {
        match self.table.lock().remove(&pid) {
            Some(process) => {
                process.exit.send_replace(Some(status));
                true
            }
            None => false,
        }
    }

    /// Make the process vanish behind the control plane's back
    ///
    /// The pid stops being alive but its waiters never observe an exit, the
    /// way a supervisor loses track of a process after a host restart.
    pub fn kill_externally(&self, pid: u32) -> bool {
        match self.table.lock().remove(&pid) {
            Some(process) => {
                self.vanished.lock().push(process.exit);
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for SimulatedProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for SimulatedProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.table.lock().contains_key(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let ignored = match self.table.lock().get(&pid) {
            Some(process) => process.ignore_signals,
            None => return Ok(()),
        };
        if ignored {
            debug!("Simulated PID {} ignored {:?}", pid, signal);
            return Ok(());
        }
        self.exit(pid, ExitStatus::signaled(signal));
        Ok(())
    }
}

/// Host processes plus the simulated pid range
pub struct HostProcessControl {
    host: NixProcessControl,
    simulated: Arc<SimulatedProcesses>,
}

impl HostProcessControl {
    pub fn new(simulated: Arc<SimulatedProcesses>) -> Self {
        Self {
            host: NixProcessControl,
            simulated,
        }
    }
}

impl ProcessControl for HostProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        if SimulatedProcesses::is_simulated(pid) {
            self.simulated.is_alive(pid)
        } else {
            self.host.is_alive(pid)
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        if SimulatedProcesses::is_simulated(pid) {
            self.simulated.signal(pid, signal)
        } else {
            self.host.signal(pid, signal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        let control = NixProcessControl;
        assert!(control.is_alive(std::process::id()));
        assert!(!control.is_alive(0));
        assert!(!control.is_alive(u32::MAX));
    }

    #[test]
    fn test_signal_to_missing_pid_is_ok() {
        // beyond the kernel's pid_max
        assert!(NixProcessControl.signal(4_194_305, Signal::Terminate).is_ok());
    }

    #[tokio::test]
    async fn test_simulated_signal_exits() {
        let table = SimulatedProcesses::new();
        let (pid, mut exit) = table.spawn(false);
        assert!(table.is_alive(pid));

        table.signal(pid, Signal::Terminate).unwrap();
        assert!(!table.is_alive(pid));

        let status = (*exit.wait_for(|s| s.is_some()).await.unwrap()).unwrap();
        assert_eq!(status.signal, Some(15));
    }

    #[test]
    fn test_ignoring_process_survives_signals() {
        let table = SimulatedProcesses::new();
        let (pid, _exit) = table.spawn(true);

        for signal in [Signal::Interrupt, Signal::Terminate, Signal::Kill] {
            table.signal(pid, signal).unwrap();
        }
        assert!(table.is_alive(pid));

        assert!(table.kill_externally(pid));
        assert!(!table.is_alive(pid));
        assert!(!table.kill_externally(pid));
    }

    #[tokio::test]
    async fn test_external_kill_is_not_observed_by_waiters() {
        let table = SimulatedProcesses::new();
        let (pid, mut exit) = table.spawn(false);

        table.kill_externally(pid);
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            exit.wait_for(|s| s.is_some()),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_host_control_routes_simulated_pids() {
        let table = Arc::new(SimulatedProcesses::new());
        let control = HostProcessControl::new(table.clone());
        let (pid, _exit) = table.spawn(false);

        assert!(control.is_alive(pid));
        assert!(control.is_alive(std::process::id()));
        control.signal(pid, Signal::Kill).unwrap();
        assert!(!control.is_alive(pid));
    }
}
