//! Startup and shutdown of a serving queue.
//!
//! The [`Controller`] owns everything a host runs: the region, the lease
//! watchdog and the worker pool. Both configs are validated before any
//! shared memory exists.

use crate::config::{PoolConfig, QueueConfig, WorkerMode};
use crate::error::{Result, ShmtaskError};
use crate::queue::{SharedRegion, TaskQueue};
use crate::submit::Submitter;
use crate::worker::{
    LeaseWatchdog, ShutdownReport, WorkerFailure, WorkerPool, scan_interval_for,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How often [`Controller::run_until`] looks for dead workers.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// Where the region lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSpec {
    /// Private to this process; only thread workers can use it.
    Anonymous,
    /// File-backed and shared by name with other processes.
    Path(PathBuf),
}

/// A running queue with its workers and reaper.
pub struct Controller {
    queue: TaskQueue,
    pool: Option<WorkerPool>,
    watchdog: Option<LeaseWatchdog>,
    poll_interval: Duration,
    stopped: bool,
}

impl Controller {
    /// Create or attach to the region, then start the reaper and workers.
    ///
    /// A leftover termination flag from an earlier host is cleared so the
    /// new workers do not exit at once.
    pub fn start(region: RegionSpec, queue_config: &QueueConfig, pool_config: PoolConfig) -> Result<Self> {
        queue_config.validate()?;
        pool_config.validate()?;
        pool_config.check_lease(queue_config.lease)?;
        if region == RegionSpec::Anonymous && pool_config.mode == WorkerMode::Process {
            return Err(ShmtaskError::Config(
                "process workers need a region path".to_string(),
            ));
        }

        let region = match region {
            RegionSpec::Anonymous => SharedRegion::anonymous(queue_config)?,
            RegionSpec::Path(path) => SharedRegion::create_or_attach(&path, queue_config)?,
        };
        let queue = TaskQueue::new(region);
        queue.clear_shutdown();

        let watchdog = LeaseWatchdog::start(queue.clone(), scan_interval_for(queue.lease()))?;
        let poll_interval = pool_config.poll_interval;
        let pool = match WorkerPool::start(queue.clone(), pool_config) {
            Ok(pool) => pool,
            Err(e) => {
                queue.region().unlink()?;
                return Err(e);
            }
        };

        tracing::info!(
            region = ?queue.region().path(),
            slots = queue.capacity(),
            lease_ms = queue.lease().as_millis() as u64,
            workers = pool.worker_count(),
            "Task queue serving"
        );

        Ok(Self {
            queue,
            pool: Some(pool),
            watchdog: Some(watchdog),
            poll_interval,
            stopped: false,
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// A producer bound to this queue, polling at the workers' interval.
    pub fn submitter(&self) -> Submitter {
        Submitter::new(self.queue.clone()).with_poll_interval(self.poll_interval)
    }

    /// Respawn dead workers. See [`WorkerPool::supervise`].
    pub fn supervise(&self) -> Vec<WorkerFailure> {
        self.pool
            .as_ref()
            .map(|pool| pool.supervise())
            .unwrap_or_default()
    }

    /// Run `work` on a scoped thread and supervise workers until it returns.
    ///
    /// One-shot callers wait on requests through this, so a worker process
    /// that dies meanwhile is reaped and replaced instead of lingering as a
    /// zombie that still looks alive to lock takeover.
    pub fn supervised<T: Send>(&self, work: impl FnOnce() -> T + Send) -> T {
        thread::scope(|scope| {
            let handle = scope.spawn(work);
            while !handle.is_finished() {
                for failure in self.supervise() {
                    tracing::warn!(%failure, "Worker failure");
                }
                thread::sleep(self.poll_interval);
            }
            match handle.join() {
                Ok(value) => value,
                Err(payload) => std::panic::resume_unwind(payload),
            }
        })
    }

    /// Supervise workers until `stop` is raised, then shut down.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<ShutdownReport> {
        while !stop.load(Ordering::SeqCst) {
            for failure in self.supervise() {
                tracing::warn!(%failure, "Worker failure");
            }
            thread::sleep(SUPERVISE_INTERVAL.max(self.poll_interval));
        }
        tracing::info!("Shutdown requested");
        self.shutdown()
    }

    /// Stop workers and the reaper, and remove the region if this process
    /// created it. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<ShutdownReport> {
        if self.stopped {
            return Ok(ShutdownReport::default());
        }
        self.stopped = true;

        let report = self
            .pool
            .take()
            .map(|pool| pool.shutdown())
            .unwrap_or_default();
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }

        self.queue.region().unlink()?;
        Ok(report)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Shutdown failed");
        }
    }
}
