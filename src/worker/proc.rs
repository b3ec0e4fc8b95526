//! Process handle for worker subprocesses.
//!
//! Workers talk to the host only through the shared region, so the handle
//! just tracks the pid and knows how to reap or stop it.

use crate::error::{Result, ShmtaskError};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How long a worker gets to react to SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(200);
const REAP_POLL: Duration = Duration::from_millis(5);

/// Handle to a worker subprocess.
#[derive(Debug)]
pub struct Proc {
    pid: Pid,
    /// Set once the process has been waited for.
    status: Option<WaitStatus>,
}

impl Proc {
    /// Take over a spawned child. The `Child` itself is dropped; reaping
    /// goes through `waitpid`.
    pub fn from_child(child: std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            status: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit status, if the process has been reaped.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Non-blocking liveness check. Reaps the process if it has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reap the process if it has exited; `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(ShmtaskError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| ShmtaskError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| ShmtaskError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        let status = waitpid(self.pid, None)
            .map_err(|e| ShmtaskError::Worker(format!("waitpid({}) failed: {}", self.pid, e)))?;
        self.status = Some(status);
        Ok(status)
    }

    /// Hard stop: SIGTERM, a short wait, then SIGKILL.
    pub fn stop(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let _ = self.terminate();
        if let Some(status) = self.wait_timeout(TERM_GRACE)? {
            return Ok(status);
        }
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.stop();
        }
    }
}
