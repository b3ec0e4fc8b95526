//! Producer side: put a request in a slot and wait for its outcome.

use crate::error::{Result, ShmtaskError};
use crate::queue::{SlotState, TaskQueue};
use crate::records::{RequestData, parse_records};
use crate::wait::{PollingWaiter, StateWaiter};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared flag a caller raises to abandon a wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one set from a Ctrl+C handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Submits requests to a [`TaskQueue`] and waits for their results.
#[derive(Clone)]
pub struct Submitter {
    queue: TaskQueue,
    waiter: Arc<dyn StateWaiter>,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancelToken,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Submitter {
    /// Polls at the default interval. The wait timeout is twice the lease,
    /// so a request whose worker died is failed by the reaper before the
    /// producer gives up.
    pub fn new(queue: TaskQueue) -> Self {
        let poll_interval = crate::config::DEFAULT_POLL_INTERVAL;
        let timeout = queue.lease() * 2;
        Self {
            queue,
            waiter: Arc::new(PollingWaiter::new(poll_interval)),
            poll_interval,
            timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_waiter(mut self, waiter: Arc<dyn StateWaiter>) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.waiter = Arc::new(PollingWaiter::new(interval));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Run one request through the queue.
    ///
    /// Oversized payloads fail before a slot is taken. If the wait is
    /// cancelled or times out the slot is left for the lease reaper.
    pub fn submit(&self, input: &[u8], operation: &[u8]) -> Result<Vec<u8>> {
        self.queue.check_request(input.len(), operation.len())?;

        let mut writer = self.queue.acquire_free_slot(input.len())?;
        writer.write_request(input, operation)?;
        let slot = writer.commit();
        tracing::debug!(
            slot = slot.index,
            generation = slot.generation,
            input_len = input.len(),
            operation_len = operation.len(),
            "Submitted request"
        );

        let started = Instant::now();
        let mut state = SlotState::RequestPending;
        loop {
            if state.is_terminal() {
                let outcome = self.queue.take_result(slot);
                tracing::debug!(
                    slot = slot.index,
                    %state,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request finished"
                );
                return outcome;
            }
            if self.cancel.is_cancelled() {
                tracing::warn!(slot = slot.index, %state, "Wait cancelled; leaving slot to the reaper");
                return Err(ShmtaskError::Cancelled { slot });
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                tracing::warn!(slot = slot.index, %state, "Wait timed out; leaving slot to the reaper");
                return Err(ShmtaskError::Timeout {
                    slot,
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let budget = self.poll_interval.min(self.timeout - elapsed);
            state = self
                .waiter
                .wait_for_state_change(&self.queue, slot, state, budget)?;
        }
    }

    /// Serialize `data`, run `operation` on it and parse the result as records.
    pub fn transform(&self, data: &RequestData, operation: &str) -> Result<Vec<Value>> {
        let payload = data.to_payload()?;
        let result = self.submit(&payload, operation.as_bytes())?;
        parse_records(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteSize, QueueConfig};
    use crate::queue::ErrorKind;
    use serde_json::json;
    use std::thread;

    fn queue(slots: u32) -> TaskQueue {
        let config = QueueConfig::default().with_slot_count(slots).with_capacities(
            ByteSize::from_bytes(64),
            ByteSize::from_bytes(32),
            ByteSize::from_bytes(128),
        );
        TaskQueue::anonymous(&config).unwrap()
    }

    /// Serve `count` requests by uppercasing the input, or failing on "fail".
    fn echo_worker(queue: TaskQueue, count: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut served = 0;
            while served < count {
                let Some(task) = queue.claim_pending_slot(0) else {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };
                let outcome = if task.operation == b"fail" {
                    Err("operation failed".to_string())
                } else {
                    Ok(task.input.to_ascii_uppercase())
                };
                queue.complete(task.handle, outcome).unwrap();
                served += 1;
            }
        })
    }

    fn submitter(queue: &TaskQueue) -> Submitter {
        Submitter::new(queue.clone()).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_submit_round_trip() {
        let q = queue(2);
        let worker = echo_worker(q.clone(), 1);
        let result = submitter(&q).submit(b"hello", b"upper").unwrap();
        worker.join().unwrap();
        assert_eq!(result, b"HELLO");
        assert_eq!(q.stats().states.empty, 2);
    }

    #[test]
    fn test_execution_error_releases_slot() {
        let q = queue(1);
        let worker = echo_worker(q.clone(), 1);
        let err = submitter(&q).submit(b"x", b"fail").unwrap_err();
        worker.join().unwrap();
        match err {
            ShmtaskError::Execution { kind, message } => {
                assert_eq!(kind, ErrorKind::Failed);
                assert_eq!(message, "operation failed");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(q.stats().states.empty, 1);
    }

    #[test]
    fn test_oversized_input_touches_nothing() {
        let q = queue(1);
        let before = q.stats();
        let err = submitter(&q).submit(&[b'a'; 65], b"op").unwrap_err();
        assert!(matches!(err, ShmtaskError::PayloadTooLarge { len: 65, .. }));
        let after = q.stats();
        assert_eq!(before.states, after.states);
        assert_eq!(before.tail, after.tail);
    }

    #[test]
    fn test_saturated_queue_rejects_immediately() {
        let q = queue(1);
        let mut w = q.acquire_free_slot(1).unwrap();
        w.write_request(b"x", b"").unwrap();
        w.commit();

        let started = Instant::now();
        let err = submitter(&q).submit(b"y", b"").unwrap_err();
        assert!(matches!(err, ShmtaskError::QueueSaturated { capacity: 1 }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cancelled_wait_leaves_slot_pending() {
        let q = queue(1);
        let token = CancelToken::new();
        token.cancel();
        let err = submitter(&q)
            .with_cancel_token(token)
            .submit(b"x", b"")
            .unwrap_err();
        assert!(matches!(err, ShmtaskError::Cancelled { .. }));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(q.stats().states.request_pending, 1);
    }

    #[test]
    fn test_timeout_without_workers() {
        let q = queue(1);
        let err = submitter(&q)
            .with_timeout(Duration::from_millis(20))
            .submit(b"x", b"")
            .unwrap_err();
        assert!(matches!(err, ShmtaskError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transform_parses_records() {
        let q = queue(1);
        let worker = echo_worker(q.clone(), 1);
        let records = submitter(&q)
            .transform(&RequestData::from_json_str(r#"["a","b"]"#), "upper")
            .unwrap();
        worker.join().unwrap();
        assert_eq!(records, vec![json!("A"), json!("B")]);
    }

    #[test]
    fn test_default_timeout_follows_lease() {
        let q = TaskQueue::anonymous(
            &QueueConfig::default()
                .with_slot_count(1)
                .with_lease(Duration::from_secs(3)),
        )
        .unwrap();
        let s = Submitter::new(q);
        assert_eq!(s.timeout, Duration::from_secs(6));
    }
}
