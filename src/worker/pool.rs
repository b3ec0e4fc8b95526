//! Worker pool.
//!
//! Starts N consumers on one queue, either as subprocesses attached to a
//! file-backed region or as threads in this process, restarts the ones that
//! die, and stops them all on shutdown.

use super::proc::Proc;
use super::signals::{TerminationReason, WorkerFailure, analyze_wait_status};
use super::spawn::spawn_worker;
use super::worker_main::{WorkerLoop, WorkerSummary};
use crate::config::{PoolConfig, WorkerMode};
use crate::error::{Result, ShmtaskError};
use crate::queue::TaskQueue;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Exit code of a Rust process that died from a panic.
const PANIC_EXIT_CODE: i32 = 101;

/// Whether a worker died without undoing its registration.
///
/// Workers that fail before attaching exit with an ordinary error code and
/// never registered; panics and signals skip the deregistration.
fn skipped_deregistration(reason: &TerminationReason) -> bool {
    !matches!(reason, TerminationReason::Exited(code) if *code != PANIC_EXIT_CODE)
}

/// How a running worker is reached.
enum WorkerHandle {
    Process(Proc),
    Thread {
        join: JoinHandle<WorkerSummary>,
        stop: Arc<AtomicBool>,
    },
}

/// A single worker in the pool.
struct Worker {
    id: u32,
    /// None once the worker is down for good.
    handle: Option<WorkerHandle>,
    restarts: usize,
    /// Work done by thread workers that have already been joined.
    summary: WorkerSummary,
}

impl Worker {
    /// Whether the worker has stopped, without blocking.
    fn has_exited(&mut self) -> bool {
        match &mut self.handle {
            None => true,
            Some(WorkerHandle::Process(proc)) => !proc.is_running(),
            Some(WorkerHandle::Thread { join, .. }) => join.is_finished(),
        }
    }

    /// Collect an exited worker and classify how it went.
    fn reap(&mut self) -> TerminationReason {
        match self.handle.take() {
            None => TerminationReason::Unknown,
            Some(WorkerHandle::Process(mut proc)) => match proc.try_wait() {
                Ok(Some(status)) => analyze_wait_status(status),
                Ok(None) => {
                    // Not actually gone; put it back.
                    self.handle = Some(WorkerHandle::Process(proc));
                    TerminationReason::StillAlive
                }
                Err(_) => TerminationReason::Unknown,
            },
            Some(WorkerHandle::Thread { join, .. }) => match join.join() {
                Ok(summary) => {
                    self.summary.completed += summary.completed;
                    self.summary.failed += summary.failed;
                    self.summary.dropped += summary.dropped;
                    TerminationReason::Exited(0)
                }
                Err(_) => TerminationReason::Exited(PANIC_EXIT_CODE),
            },
        }
    }

    /// Stop without waiting for the termination flag to be noticed.
    ///
    /// Returns how a process worker ended. A detached thread still
    /// deregisters itself when it finishes, so it yields `None`.
    fn hard_stop(&mut self) -> Option<TerminationReason> {
        match self.handle.take() {
            None => None,
            Some(WorkerHandle::Process(mut proc)) => match proc.stop() {
                Ok(status) => Some(analyze_wait_status(status)),
                Err(e) => {
                    tracing::warn!(worker_id = self.id, error = %e, "Failed to stop worker process");
                    Some(TerminationReason::Unknown)
                }
            },
            Some(WorkerHandle::Thread { join, stop }) => {
                stop.store(true, Ordering::Relaxed);
                // Threads cannot be killed; one stuck in a transform is left
                // to finish on its own.
                tracing::warn!(worker_id = self.id, "Detaching worker thread that did not stop in time");
                drop(join);
                None
            }
        }
    }
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that saw the termination flag and exited on their own.
    pub graceful: usize,
    /// Workers stopped after the grace period ran out.
    pub hard_stopped: usize,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    /// Workers currently up.
    pub running: usize,
    pub total_restarts: usize,
    /// Requests completed by thread workers that have been joined.
    pub completed: u64,
}

/// A pool of consumers for one task queue.
pub struct WorkerPool {
    queue: TaskQueue,
    config: PoolConfig,
    /// Set in process mode; subprocesses attach by path.
    region_path: Option<PathBuf>,
    workers: Vec<Mutex<Worker>>,
}

impl WorkerPool {
    /// Start `config.worker_count` workers.
    ///
    /// Process mode needs a file-backed region so that workers can attach.
    pub fn start(queue: TaskQueue, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        config.check_lease(queue.lease())?;

        let region_path = match config.mode {
            WorkerMode::Process => Some(
                queue
                    .region()
                    .path()
                    .map(|p| p.to_path_buf())
                    .ok_or_else(|| {
                        ShmtaskError::Config(
                            "process workers need a file-backed region; use thread mode for anonymous regions"
                                .to_string(),
                        )
                    })?,
            ),
            WorkerMode::Thread => None,
        };

        let mut pool = Self {
            queue,
            config,
            region_path,
            workers: Vec::new(),
        };

        for id in 0..pool.config.worker_count as u32 {
            let handle = pool.launch(id)?;
            pool.workers.push(Mutex::new(Worker {
                id,
                handle: Some(handle),
                restarts: 0,
                summary: WorkerSummary::default(),
            }));
        }

        tracing::info!(
            workers = pool.workers.len(),
            mode = ?pool.config.mode,
            transform = pool.config.transform.name(),
            "Worker pool started"
        );
        Ok(pool)
    }

    fn launch(&self, id: u32) -> Result<WorkerHandle> {
        match &self.region_path {
            Some(path) => Ok(WorkerHandle::Process(spawn_worker(path, id, &self.config)?)),
            None => {
                let stop = Arc::new(AtomicBool::new(false));
                let worker = WorkerLoop::new(
                    self.queue.clone(),
                    id,
                    self.config.poll_interval,
                    self.config.transform.build(),
                )
                .with_stop_flag(stop.clone());
                let join = thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker.run())?;
                Ok(WorkerHandle::Thread { join, stop })
            }
        }
    }

    fn lock(worker: &Mutex<Worker>) -> MutexGuard<'_, Worker> {
        worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Check every worker and respawn the ones that died unexpectedly.
    ///
    /// Slots a dead worker had claimed are not touched here; their lease
    /// runs out and the reaper fails them.
    pub fn supervise(&self) -> Vec<WorkerFailure> {
        if self.queue.shutdown_requested() {
            return Vec::new();
        }

        let mut failures = Vec::new();
        for worker in &self.workers {
            let mut w = Self::lock(worker);
            if w.handle.is_none() || !w.has_exited() {
                continue;
            }

            let reason = w.reap();
            if matches!(reason, TerminationReason::StillAlive) {
                continue;
            }
            if skipped_deregistration(&reason) {
                self.queue.deregister_worker();
            }

            tracing::warn!(
                worker_id = w.id,
                reason = %reason,
                recoverable = reason.is_recoverable(),
                "Worker died unexpectedly"
            );

            let mut respawned = false;
            if reason.is_recoverable() && w.restarts < self.config.max_restarts {
                w.restarts += 1;
                tracing::info!(
                    worker_id = w.id,
                    restart_count = w.restarts,
                    "Attempting to respawn worker"
                );
                match self.launch(w.id) {
                    Ok(handle) => {
                        w.handle = Some(handle);
                        respawned = true;
                    }
                    Err(e) => {
                        tracing::error!(worker_id = w.id, error = %e, "Failed to respawn worker");
                    }
                }
            } else if reason.is_recoverable() {
                tracing::error!(
                    worker_id = w.id,
                    restarts = w.restarts,
                    "Worker exceeded its restart budget; leaving it down"
                );
            }

            failures.push(WorkerFailure {
                worker_id: w.id,
                reason,
                respawned,
            });
        }
        failures
    }

    /// Raise the termination flag, give workers the grace period to notice,
    /// then hard-stop whoever is left.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.workers.iter().all(|w| Self::lock(w).handle.is_none()) {
            return report;
        }

        self.queue.request_shutdown();
        let grace = self.config.grace_period();
        let deadline = Instant::now() + grace;
        tracing::debug!(grace_ms = grace.as_millis() as u64, "Waiting for workers to exit");

        loop {
            let mut remaining = 0;
            for worker in &self.workers {
                let mut w = Self::lock(worker);
                if w.handle.is_none() {
                    continue;
                }
                if w.has_exited() {
                    let reason = w.reap();
                    if skipped_deregistration(&reason) {
                        self.queue.deregister_worker();
                    }
                    report.graceful += 1;
                    tracing::debug!(worker_id = w.id, reason = %reason, "Worker exited");
                } else {
                    remaining += 1;
                }
            }
            if remaining == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.config.poll_interval);
        }

        for worker in &self.workers {
            let mut w = Self::lock(worker);
            if w.handle.is_none() {
                continue;
            }
            if let Some(reason) = w.hard_stop() {
                tracing::debug!(worker_id = w.id, reason = %reason, "Worker stopped");
                if skipped_deregistration(&reason) {
                    self.queue.deregister_worker();
                }
            }
            report.hard_stopped += 1;
        }

        tracing::info!(
            graceful = report.graceful,
            hard_stopped = report.hard_stopped,
            "Worker pool stopped"
        );
        report
    }

    /// Get statistics about the worker pool.
    pub fn stats(&self) -> WorkerPoolStats {
        let mut stats = WorkerPoolStats {
            worker_count: self.workers.len(),
            running: 0,
            total_restarts: 0,
            completed: 0,
        };
        for worker in &self.workers {
            let w = Self::lock(worker);
            if w.handle.is_some() {
                stats.running += 1;
            }
            stats.total_restarts += w.restarts;
            stats.completed += w.summary.completed;
        }
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::submit::Submitter;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::time::Duration;

    fn thread_config(workers: usize) -> PoolConfig {
        PoolConfig::default()
            .with_mode(WorkerMode::Thread)
            .with_workers(workers)
            .with_poll_interval(Duration::from_millis(1))
    }

    /// Add a registered worker process that never looks at the queue, the
    /// way a worker stuck in a transform would behave. Respawns of it launch
    /// thread workers since the pool has no region path.
    fn adopt_stuck_process(pool: &mut WorkerPool) -> Pid {
        let child = std::process::Command::new("sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let proc = Proc::from_child(child);
        let pid = proc.pid();
        pool.queue.register_worker();
        pool.workers.push(Mutex::new(Worker {
            id: pool.workers.len() as u32,
            handle: Some(WorkerHandle::Process(proc)),
            restarts: 0,
            summary: WorkerSummary::default(),
        }));
        pid
    }

    fn wait_for_registered(queue: &TaskQueue, expected: u32) {
        let started = Instant::now();
        while queue.stats().registered_workers != expected {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "registered workers stuck at {}",
                queue.stats().registered_workers
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for_failure(pool: &WorkerPool) -> WorkerFailure {
        let started = Instant::now();
        loop {
            if let Some(failure) = pool.supervise().into_iter().next() {
                return failure;
            }
            assert!(started.elapsed() < Duration::from_secs(5), "no worker failure seen");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_skipped_deregistration() {
        assert!(!skipped_deregistration(&TerminationReason::Exited(0)));
        assert!(!skipped_deregistration(&TerminationReason::Exited(1)));
        assert!(skipped_deregistration(&TerminationReason::Exited(101)));
        assert!(skipped_deregistration(&TerminationReason::Killed));
    }

    #[test]
    fn test_process_mode_needs_file_backed_region() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(2)).unwrap();
        let err = WorkerPool::start(queue, PoolConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ShmtaskError::Config(_)));
    }

    #[test]
    fn test_rejects_invalid_worker_count() {
        let queue = TaskQueue::anonymous(&QueueConfig::default()).unwrap();
        let err = WorkerPool::start(queue.clone(), thread_config(17)).err().unwrap();
        assert!(err.to_string().contains("worker count"));
        assert_eq!(queue.stats().registered_workers, 0);
    }

    #[test]
    fn test_thread_pool_processes_and_stops() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(8)).unwrap();
        let pool = WorkerPool::start(queue.clone(), thread_config(3)).unwrap();
        assert_eq!(pool.worker_count(), 3);

        let submitter = Submitter::new(queue.clone()).with_poll_interval(Duration::from_millis(1));
        let result = submitter.submit(b"[1,2,3]", b"multiply by 2").unwrap();
        assert_eq!(result, b"[2,4,6]");

        let report = pool.shutdown();
        assert_eq!(report.graceful, 3);
        assert_eq!(report.hard_stopped, 0);
        assert!(queue.shutdown_requested());
        assert_eq!(queue.stats().registered_workers, 0);
        assert_eq!(pool.stats().running, 0);
        assert_eq!(pool.stats().completed, 1);

        // Idempotent.
        assert_eq!(pool.shutdown(), ShutdownReport::default());
    }

    #[test]
    fn test_supervise_is_quiet_while_healthy() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(2)).unwrap();
        let pool = WorkerPool::start(queue, thread_config(2)).unwrap();
        assert!(pool.supervise().is_empty());
        assert_eq!(pool.stats().running, 2);
    }

    #[test]
    fn test_hard_stop_deregisters_process_worker() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(2)).unwrap();
        let mut pool = WorkerPool::start(queue.clone(), thread_config(1)).unwrap();
        let pid = adopt_stuck_process(&mut pool);
        wait_for_registered(&queue, 2);

        let report = pool.shutdown();
        assert_eq!(report.graceful, 1);
        assert_eq!(report.hard_stopped, 1);
        assert_eq!(queue.stats().registered_workers, 0);
        assert!(kill(pid, None).is_err());
    }

    #[test]
    fn test_supervise_respawns_killed_worker() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(4)).unwrap();
        let mut pool = WorkerPool::start(queue.clone(), thread_config(1)).unwrap();
        let pid = adopt_stuck_process(&mut pool);
        wait_for_registered(&queue, 2);

        kill(pid, Signal::SIGKILL).unwrap();
        let failure = wait_for_failure(&pool);
        assert_eq!(failure.worker_id, 1);
        assert_eq!(failure.reason, TerminationReason::Killed);
        assert!(failure.respawned);

        let stats = pool.stats();
        assert_eq!(stats.total_restarts, 1);
        assert_eq!(stats.running, 2);
        wait_for_registered(&queue, 2);
        assert!(pool.supervise().is_empty());

        let submitter = Submitter::new(queue.clone()).with_poll_interval(Duration::from_millis(1));
        assert_eq!(submitter.submit(b"[1,2]", b"sum").unwrap(), b"3");

        let report = pool.shutdown();
        assert_eq!(report.graceful, 2);
        assert_eq!(queue.stats().registered_workers, 0);
    }

    #[test]
    fn test_supervise_respects_restart_budget() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(2)).unwrap();
        let mut config = thread_config(1);
        config.max_restarts = 0;
        let mut pool = WorkerPool::start(queue.clone(), config).unwrap();
        let pid = adopt_stuck_process(&mut pool);
        wait_for_registered(&queue, 2);

        kill(pid, Signal::SIGKILL).unwrap();
        let failure = wait_for_failure(&pool);
        assert_eq!(failure.reason, TerminationReason::Killed);
        assert!(!failure.respawned);

        let stats = pool.stats();
        assert_eq!(stats.total_restarts, 0);
        assert_eq!(stats.running, 1);
        assert_eq!(queue.stats().registered_workers, 1);
        // A worker left down is not reported again.
        assert!(pool.supervise().is_empty());
        pool.shutdown();
    }

    #[test]
    fn test_rejects_command_timeout_beyond_lease() {
        let queue = TaskQueue::anonymous(
            &QueueConfig::default().with_lease(Duration::from_secs(5)),
        )
        .unwrap();
        let config = thread_config(1).with_transform(crate::transform::TransformKind::command("cat", vec![]));
        let err = WorkerPool::start(queue.clone(), config).err().unwrap();
        assert!(err.to_string().contains("lease"));
        assert_eq!(queue.stats().registered_workers, 0);
    }
}
