//! The consumer loop and the worker subprocess entry point.
//!
//! The entry point runs when `shmtask worker` is invoked by the pool. It
//! attaches to the region, builds its transform and polls for work until the
//! termination flag is raised.

use crate::error::Result;
use crate::queue::{SharedRegion, SlotState, TaskQueue};
use crate::transform::{Transform, TransformKind};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// What a worker did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub failed: u64,
    /// Outcomes the queue refused, e.g. because the reaper got there first.
    pub dropped: u64,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One consumer: sleep, check for termination, claim, transform, complete.
pub struct WorkerLoop {
    queue: TaskQueue,
    worker_id: u32,
    poll_interval: Duration,
    transform: Box<dyn Transform>,
    stop: Option<Arc<AtomicBool>>,
    summary: WorkerSummary,
}

impl WorkerLoop {
    pub fn new(
        queue: TaskQueue,
        worker_id: u32,
        poll_interval: Duration,
        transform: Box<dyn Transform>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            poll_interval,
            transform,
            stop: None,
            summary: WorkerSummary::default(),
        }
    }

    /// Extra stop flag private to this worker, checked alongside the
    /// region's termination flag.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn should_stop(&self) -> bool {
        self.queue.shutdown_requested()
            || self
                .stop
                .as_ref()
                .is_some_and(|s| s.load(Ordering::Relaxed))
    }

    /// Claim and process at most one request. Returns whether one was found.
    ///
    /// The transform runs with no lock held, on copies of the slot buffers.
    pub fn run_once(&mut self) -> bool {
        let Some(task) = self.queue.claim_pending_slot(self.worker_id) else {
            return false;
        };

        let transform = &mut self.transform;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            transform.apply(&task.input, &task.operation)
        })) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!(
                "transformation panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        match self.queue.complete(task.handle, outcome) {
            Ok(state) => {
                if state == SlotState::ResponseReady {
                    self.summary.completed += 1;
                } else {
                    self.summary.failed += 1;
                }
                tracing::debug!(
                    worker_id = self.worker_id,
                    slot = task.handle.index,
                    generation = task.handle.generation,
                    %state,
                    "Request processed"
                );
            }
            Err(e) => {
                self.summary.dropped += 1;
                tracing::warn!(
                    worker_id = self.worker_id,
                    slot = task.handle.index,
                    error = %e,
                    "Discarded outcome for a slot that moved on"
                );
            }
        }
        true
    }

    /// Poll until told to stop, then tear down the transform.
    pub fn run(mut self) -> WorkerSummary {
        let registered = self.queue.register_worker();
        tracing::info!(
            worker_id = self.worker_id,
            transform = self.transform.name(),
            registered,
            "Worker started"
        );

        loop {
            thread::sleep(self.poll_interval);
            if self.should_stop() {
                break;
            }
            self.run_once();
        }

        self.transform.teardown();
        self.queue.deregister_worker();
        tracing::info!(
            worker_id = self.worker_id,
            completed = self.summary.completed,
            failed = self.summary.failed,
            "Worker stopped"
        );
        self.summary
    }
}

/// Entry point of a worker subprocess.
///
/// Ctrl+C is ignored so that a terminal interrupt reaches the host, which
/// then raises the termination flag. SIGTERM keeps its default action and
/// serves as the hard stop.
pub fn run_worker_main(
    region: &Path,
    worker_id: u32,
    poll_interval: Duration,
    transform: &TransformKind,
) -> Result<WorkerSummary> {
    // SAFETY: installing SIG_IGN has no handler code to run.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGINT,
            nix::sys::signal::SigHandler::SigIgn,
        );
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    let queue = TaskQueue::new(SharedRegion::attach(region)?);

    // Leave if the host goes away without raising the flag.
    let orphaned = Arc::new(AtomicBool::new(false));
    let parent = nix::unistd::getppid();
    {
        let orphaned = orphaned.clone();
        thread::Builder::new()
            .name(format!("worker-{worker_id}-parent"))
            .spawn(move || {
                while !orphaned.load(Ordering::Relaxed) {
                    if nix::unistd::getppid() != parent {
                        tracing::warn!(worker_id, "Host process exited; stopping worker");
                        orphaned.store(true, Ordering::Relaxed);
                        break;
                    }
                    thread::sleep(Duration::from_millis(250));
                }
            })?;
    }

    let summary = WorkerLoop::new(queue, worker_id, poll_interval, transform.build())
        .with_stop_flag(orphaned.clone())
        .run();
    orphaned.store(true, Ordering::Relaxed);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::ShmtaskError;
    use crate::transform::TransformError;

    struct Panicky;

    impl Transform for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn apply(&mut self, _input: &[u8], _op: &[u8]) -> std::result::Result<Vec<u8>, TransformError> {
            panic!("boom");
        }
    }

    fn submit(queue: &TaskQueue, input: &[u8], op: &[u8]) -> crate::queue::SlotHandle {
        let mut w = queue.acquire_free_slot(input.len()).unwrap();
        w.write_request(input, op).unwrap();
        w.commit()
    }

    fn worker(queue: &TaskQueue, transform: Box<dyn Transform>) -> WorkerLoop {
        WorkerLoop::new(queue.clone(), 0, Duration::from_millis(1), transform)
    }

    #[test]
    fn test_run_once_processes_request() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(2)).unwrap();
        let slot = submit(&queue, b"[1,2,3,4,5]", b"increment by 10");

        let mut w = worker(&queue, TransformKind::Sandbox.build());
        assert!(w.run_once());
        assert!(!w.run_once());
        assert_eq!(queue.slot_state(slot).unwrap(), SlotState::ResponseReady);
        assert_eq!(queue.take_result(slot).unwrap(), b"[11,12,13,14,15]");
        assert_eq!(w.summary.completed, 1);
    }

    #[test]
    fn test_transform_error_becomes_slot_error() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(1)).unwrap();
        let slot = submit(&queue, b"[1]", b"launch missiles");

        let mut w = worker(&queue, TransformKind::Sandbox.build());
        w.run_once();
        match queue.take_result(slot).unwrap_err() {
            ShmtaskError::Execution { message, .. } => {
                assert_eq!(message, "unsupported operation step 'launch missiles'");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(w.summary.failed, 1);
    }

    #[test]
    fn test_panicking_transform_is_contained() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(1)).unwrap();
        let slot = submit(&queue, b"x", b"y");

        let mut w = worker(&queue, Box::new(Panicky));
        assert!(w.run_once());
        match queue.take_result(slot).unwrap_err() {
            ShmtaskError::Execution { message, .. } => {
                assert!(message.contains("panicked: boom"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_exits_on_termination_flag() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(1)).unwrap();
        let handle = {
            let queue = queue.clone();
            thread::spawn(move || worker(&queue, TransformKind::Sandbox.build()).run())
        };

        let slot = submit(&queue, b"[1,2]", b"sum");
        let mut state = queue.slot_state(slot).unwrap();
        for _ in 0..5000 {
            if state.is_terminal() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
            state = queue.slot_state(slot).unwrap();
        }
        assert_eq!(state, SlotState::ResponseReady);
        assert_eq!(queue.stats().registered_workers, 1);

        queue.request_shutdown();
        let summary = handle.join().unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(queue.stats().registered_workers, 0);
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(1)).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let summary = worker(&queue, TransformKind::Sandbox.build())
            .with_stop_flag(stop)
            .run();
        assert_eq!(summary, WorkerSummary::default());
    }

    #[test]
    fn test_late_completion_is_dropped() {
        let queue = TaskQueue::anonymous(&QueueConfig::default().with_slot_count(1)).unwrap();
        submit(&queue, b"[1]", b"identity");

        struct Reaping(TaskQueue);
        impl Transform for Reaping {
            fn name(&self) -> &str {
                "reaping"
            }
            fn apply(&mut self, input: &[u8], _op: &[u8]) -> std::result::Result<Vec<u8>, TransformError> {
                // Simulate the lease running out mid-transform.
                self.0.reap_expired(u64::MAX);
                Ok(input.to_vec())
            }
        }

        let mut w = worker(&queue, Box::new(Reaping(queue.clone())));
        assert!(w.run_once());
        assert_eq!(w.summary.dropped, 1);
        assert_eq!(queue.stats().states.error, 1);
    }

    /// Echoes its input and logs every request it was handed.
    struct Recording(Arc<std::sync::Mutex<Vec<Vec<u8>>>>);

    impl Transform for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn apply(&mut self, input: &[u8], _op: &[u8]) -> std::result::Result<Vec<u8>, TransformError> {
            self.0.lock().unwrap().push(input.to_vec());
            thread::sleep(Duration::from_millis(2));
            Ok(input.to_vec())
        }
    }

    #[test]
    fn test_concurrent_workers_claim_each_request_once() {
        use crate::submit::Submitter;

        const WORKERS: usize = 3;
        const REQUESTS: usize = 12;

        let queue =
            TaskQueue::anonymous(&QueueConfig::default().with_slot_count(REQUESTS as u32)).unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..WORKERS)
            .map(|id| {
                let queue = queue.clone();
                let log = log.clone();
                thread::spawn(move || {
                    WorkerLoop::new(queue, id as u32, Duration::from_millis(1), Box::new(Recording(log)))
                        .run()
                })
            })
            .collect();

        let producers: Vec<_> = (0..REQUESTS)
            .map(|i| {
                let submitter =
                    Submitter::new(queue.clone()).with_poll_interval(Duration::from_millis(1));
                thread::spawn(move || {
                    let input = format!("[{i}]");
                    let result = submitter.submit(input.as_bytes(), b"echo").unwrap();
                    assert_eq!(result, input.as_bytes());
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        queue.request_shutdown();
        let completed: u64 = workers
            .into_iter()
            .map(|w| w.join().unwrap().completed)
            .sum();
        assert_eq!(completed, REQUESTS as u64);

        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        let mut expected: Vec<Vec<u8>> = (0..REQUESTS).map(|i| format!("[{i}]").into_bytes()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(queue.stats().total_claims, REQUESTS as u64);
        assert_eq!(queue.stats().states.empty, REQUESTS as u32);
    }
}
