//! Crash analysis for worker subprocesses.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// SIGKILL, usually the OOM killer or an operator.
    Killed,
    /// SIGSEGV, SIGBUS or SIGABRT.
    Crashed(Signal),
    /// Any other signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Whether the worker should be respawned.
    ///
    /// A clean exit means the worker saw the termination flag; everything
    /// else is an unexpected death.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Exited(0) | Self::StillAlive)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Signaled(sig) => format!("terminated by {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT => {
                TerminationReason::Crashed(signal)
            }
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// A worker that stopped without being asked to.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub worker_id: u32,
    pub reason: TerminationReason,
    /// Whether a replacement was started.
    pub respawned: bool,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {} {}", self.worker_id, self.reason)?;
        if self.respawned {
            write!(f, " (respawned)")?;
        }
        Ok(())
    }
}
