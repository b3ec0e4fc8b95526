//! Slot allocation, claiming, completion and recovery.
//!
//! Lock order is always queue lock, then slot lock. Paths that take only a
//! slot lock never reach for the queue lock while holding it.

use super::lock::{self, ShmLockGuard};
use super::region::SharedRegion;
use super::slot::{ErrorKind, SlotHandle, SlotState};
use super::{layout::SlotHeader, now_millis};
use crate::config::QueueConfig;
use crate::error::{BufferKind, Result, ShmtaskError};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Handle to a task queue living in a [`SharedRegion`].
///
/// Cheap to clone; every clone refers to the same slots.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    region: Arc<SharedRegion>,
}

/// A request copied out of a slot by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub handle: SlotHandle,
    pub input: Vec<u8>,
    pub operation: Vec<u8>,
}

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Claimed slots whose lease ran out, now `ERROR`.
    pub expired: Vec<SlotHandle>,
    /// Finished slots nobody picked up, now `EMPTY`.
    pub reclaimed: Vec<SlotHandle>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.reclaimed.is_empty()
    }
}

/// Slot counts per state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub empty: u32,
    pub request_pending: u32,
    pub claimed: u32,
    pub response_ready: u32,
    pub error: u32,
}

impl StateCounts {
    fn bump(&mut self, state: SlotState) {
        match state {
            SlotState::Empty => self.empty += 1,
            SlotState::RequestPending => self.request_pending += 1,
            SlotState::Claimed => self.claimed += 1,
            SlotState::ResponseReady => self.response_ready += 1,
            SlotState::Error => self.error += 1,
        }
    }

    pub fn in_use(&self) -> u32 {
        self.request_pending + self.claimed + self.response_ready + self.error
    }
}

/// Point-in-time view of the queue, taken without locks.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub slot_count: u32,
    pub head: u32,
    pub tail: u32,
    pub states: StateCounts,
    pub registered_workers: u32,
    pub total_claims: u64,
    pub input_capacity: u32,
    pub operation_capacity: u32,
    pub result_capacity: u32,
    pub lease_ms: u32,
    pub shutdown_requested: bool,
    pub created_at_ms: u64,
}

fn load_state(slot: &SlotHeader) -> SlotState {
    // Anything unreadable is treated as busy so nobody touches it.
    SlotState::try_from(slot.state.load(Ordering::Acquire)).unwrap_or(SlotState::Claimed)
}

/// Cut `message` down to at most `max` bytes without splitting a character.
fn truncate_message(message: &str, max: usize) -> &str {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

impl TaskQueue {
    pub fn new(region: SharedRegion) -> Self {
        Self::from_shared(Arc::new(region))
    }

    pub fn from_shared(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    /// A queue in a private anonymous mapping, for in-process use and tests.
    pub fn anonymous(config: &QueueConfig) -> Result<Self> {
        Ok(Self::new(SharedRegion::anonymous(config)?))
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.region.layout().slot_count as usize
    }

    pub fn input_capacity(&self) -> usize {
        self.region.layout().input_capacity as usize
    }

    pub fn operation_capacity(&self) -> usize {
        self.region.layout().operation_capacity as usize
    }

    pub fn result_capacity(&self) -> usize {
        self.region.layout().result_capacity as usize
    }

    /// Lease recorded in the region header.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms())
    }

    fn lease_ms(&self) -> u64 {
        u64::from(self.region.header().lease_ms.load(Ordering::Relaxed))
    }

    fn slot_count(&self) -> u32 {
        self.region.layout().slot_count
    }

    fn slot(&self, handle: SlotHandle) -> Result<&SlotHeader> {
        if handle.index >= self.slot_count() {
            return Err(ShmtaskError::SlotLost { slot: handle });
        }
        Ok(self.region.slot_header(handle.index))
    }

    /// Reject payloads that do not fit, before anything is touched.
    pub fn check_request(&self, input_len: usize, operation_len: usize) -> Result<()> {
        if input_len > self.input_capacity() {
            return Err(ShmtaskError::PayloadTooLarge {
                buffer: BufferKind::Input,
                len: input_len,
                capacity: self.input_capacity(),
            });
        }
        if operation_len > self.operation_capacity() {
            return Err(ShmtaskError::PayloadTooLarge {
                buffer: BufferKind::Operation,
                len: operation_len,
                capacity: self.operation_capacity(),
            });
        }
        Ok(())
    }

    /// Reserve an `EMPTY` slot for a new request.
    ///
    /// `size_hint` is the expected input length; it is checked up front so a
    /// hopeless request never takes a slot. The returned writer keeps the
    /// slot locked until it is committed or dropped.
    pub fn acquire_free_slot(&self, size_hint: usize) -> Result<SlotWriter<'_>> {
        self.check_request(size_hint, 0)?;

        let header = self.region.header();
        let n = self.slot_count();
        let _queue_guard = lock::lock(&header.queue_lock);
        let tail = header.tail.load(Ordering::Relaxed) % n;

        for offset in 0..n {
            let index = (tail + offset) % n;
            let slot = self.region.slot_header(index);
            if load_state(slot) != SlotState::Empty {
                continue;
            }
            let guard = lock::lock(&slot.lock);
            if load_state(slot) != SlotState::Empty {
                continue;
            }

            let generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
            slot.generation.store(generation, Ordering::Relaxed);
            slot.input_len.store(0, Ordering::Relaxed);
            slot.operation_len.store(0, Ordering::Relaxed);
            slot.result_len.store(0, Ordering::Relaxed);
            slot.error_kind.store(0, Ordering::Relaxed);
            slot.claimed_by.store(0, Ordering::Relaxed);
            // Pending requests carry no lease; one starts when a worker claims.
            slot.lease_deadline_ms.store(0, Ordering::Relaxed);
            slot.state
                .store(SlotState::RequestPending as u32, Ordering::Release);
            header.tail.store((index + 1) % n, Ordering::Relaxed);

            let handle = SlotHandle { index, generation };
            tracing::trace!(slot = index, generation, "Acquired slot");
            return Ok(SlotWriter {
                queue: self,
                handle,
                guard: Some(guard),
            });
        }

        tracing::debug!(capacity = n, "No free slot");
        Err(ShmtaskError::QueueSaturated { capacity: n as usize })
    }

    /// Claim the first pending request at or after `head`.
    ///
    /// Slots whose lock is busy are skipped rather than waited on.
    pub fn claim_pending_slot(&self, worker_id: u32) -> Option<ClaimedTask> {
        let header = self.region.header();
        let n = self.slot_count();
        let _queue_guard = lock::lock(&header.queue_lock);
        let head = header.head.load(Ordering::Relaxed) % n;

        for offset in 0..n {
            let index = (head + offset) % n;
            let slot = self.region.slot_header(index);
            if load_state(slot) != SlotState::RequestPending {
                continue;
            }
            let Some(_slot_guard) = lock::try_lock(&slot.lock) else {
                continue;
            };
            if load_state(slot) != SlotState::RequestPending {
                continue;
            }

            let input_len = slot.input_len.load(Ordering::Relaxed) as usize;
            let operation_len = slot.operation_len.load(Ordering::Relaxed) as usize;
            let input = self.region.read_buffer(index, BufferKind::Input, input_len);
            let operation = self
                .region
                .read_buffer(index, BufferKind::Operation, operation_len);

            slot.claimed_by
                .store(worker_id.wrapping_add(1), Ordering::Relaxed);
            slot.claims.fetch_add(1, Ordering::Relaxed);
            slot.lease_deadline_ms
                .store(now_millis() + self.lease_ms(), Ordering::Relaxed);
            slot.state.store(SlotState::Claimed as u32, Ordering::Release);
            header.head.store((index + 1) % n, Ordering::Relaxed);
            header.total_claims.fetch_add(1, Ordering::Relaxed);

            let handle = SlotHandle {
                index,
                generation: slot.generation.load(Ordering::Relaxed),
            };
            tracing::trace!(slot = index, generation = handle.generation, worker_id, "Claimed slot");
            return Some(ClaimedTask {
                handle,
                input,
                operation,
            });
        }
        None
    }

    /// Reject `from -> to` unless the slot state machine has that edge.
    fn check_transition(handle: SlotHandle, from: SlotState, to: SlotState) -> Result<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(ShmtaskError::InvalidTransition {
                slot: handle,
                from,
                to,
            })
        }
    }

    /// Lock a slot and confirm the handle still refers to the live acquisition.
    fn lock_current(&self, handle: SlotHandle) -> Result<(&SlotHeader, ShmLockGuard<'_>)> {
        let slot = self.slot(handle)?;
        let guard = lock::lock(&slot.lock);
        if slot.generation.load(Ordering::Relaxed) != handle.generation {
            return Err(ShmtaskError::SlotLost { slot: handle });
        }
        Ok((slot, guard))
    }

    /// Record a worker's outcome for a claimed slot.
    ///
    /// A result that does not fit becomes a result-too-large error. Returns
    /// the state the slot was moved to.
    pub fn complete(
        &self,
        handle: SlotHandle,
        outcome: std::result::Result<Vec<u8>, String>,
    ) -> Result<SlotState> {
        let (slot, _guard) = self.lock_current(handle)?;
        let current = load_state(slot);
        let capacity = self.result_capacity();

        let (next, payload, kind) = match outcome {
            Ok(bytes) if bytes.len() <= capacity => (SlotState::ResponseReady, bytes, None),
            Ok(bytes) => {
                let message = format!(
                    "result of {} bytes exceeds the {}-byte result buffer",
                    bytes.len(),
                    capacity
                );
                (
                    SlotState::Error,
                    message.into_bytes(),
                    Some(ErrorKind::ResultTooLarge),
                )
            }
            Err(message) => (
                SlotState::Error,
                truncate_message(&message, capacity).as_bytes().to_vec(),
                Some(ErrorKind::Failed),
            ),
        };

        Self::check_transition(handle, current, next)?;

        let payload = if payload.len() > capacity {
            payload[..capacity].to_vec()
        } else {
            payload
        };
        self.region
            .write_buffer(handle.index, BufferKind::Result, &payload);
        slot.result_len.store(payload.len() as u32, Ordering::Relaxed);
        slot.error_kind
            .store(kind.map_or(0, |k| k as u32), Ordering::Relaxed);
        slot.lease_deadline_ms
            .store(now_millis() + self.lease_ms(), Ordering::Relaxed);
        slot.state.store(next as u32, Ordering::Release);

        tracing::trace!(slot = handle.index, generation = handle.generation, state = %next, "Completed slot");
        Ok(next)
    }

    /// Current state of the acquisition `handle` refers to.
    pub fn slot_state(&self, handle: SlotHandle) -> Result<SlotState> {
        let (slot, _guard) = self.lock_current(handle)?;
        Ok(load_state(slot))
    }

    /// Consume a finished slot: copy out its result or error and release it.
    pub fn take_result(&self, handle: SlotHandle) -> Result<Vec<u8>> {
        let (slot, _guard) = self.lock_current(handle)?;
        let current = load_state(slot);
        Self::check_transition(handle, current, SlotState::Empty)?;

        let len = slot.result_len.load(Ordering::Relaxed) as usize;
        let bytes = self.region.read_buffer(handle.index, BufferKind::Result, len);
        let kind = ErrorKind::from_raw(slot.error_kind.load(Ordering::Relaxed));
        self.clear_slot(handle.index, slot);

        match current {
            SlotState::ResponseReady => Ok(bytes),
            _ => Err(ShmtaskError::Execution {
                kind,
                message: String::from_utf8_lossy(&bytes).into_owned(),
            }),
        }
    }

    /// Return a finished slot to `EMPTY` without reading it.
    pub fn release_slot(&self, handle: SlotHandle) -> Result<()> {
        let (slot, _guard) = self.lock_current(handle)?;
        let current = load_state(slot);
        Self::check_transition(handle, current, SlotState::Empty)?;
        self.clear_slot(handle.index, slot);
        Ok(())
    }

    /// Zero the used part of every buffer and mark the slot `EMPTY`. Slot lock held.
    fn clear_slot(&self, index: u32, slot: &SlotHeader) {
        for (kind, len) in [
            (BufferKind::Input, &slot.input_len),
            (BufferKind::Operation, &slot.operation_len),
            (BufferKind::Result, &slot.result_len),
        ] {
            self.region
                .zero_buffer(index, kind, len.load(Ordering::Relaxed) as usize);
            len.store(0, Ordering::Relaxed);
        }
        slot.error_kind.store(0, Ordering::Relaxed);
        slot.claimed_by.store(0, Ordering::Relaxed);
        slot.lease_deadline_ms.store(0, Ordering::Relaxed);
        slot.state.store(SlotState::Empty as u32, Ordering::Release);
    }

    /// Recover slots whose lease ended before `now_ms`.
    ///
    /// Claimed slots fail with a lease-expired error so a waiting producer
    /// gets an answer; finished slots nobody consumed go back to `EMPTY`.
    /// Pending requests have no lease and wait for a worker however long the
    /// backlog is. Slots whose lock is busy are left for the next pass.
    pub fn reap_expired(&self, now_ms: u64) -> ReapReport {
        let mut report = ReapReport::default();
        let capacity = self.result_capacity();

        for index in 0..self.slot_count() {
            let slot = self.region.slot_header(index);
            let deadline = slot.lease_deadline_ms.load(Ordering::Relaxed);
            if deadline == 0 || deadline > now_ms || load_state(slot) == SlotState::Empty {
                continue;
            }
            let Some(_guard) = lock::try_lock(&slot.lock) else {
                continue;
            };
            let deadline = slot.lease_deadline_ms.load(Ordering::Relaxed);
            if deadline == 0 || deadline > now_ms {
                continue;
            }

            let handle = SlotHandle {
                index,
                generation: slot.generation.load(Ordering::Relaxed),
            };
            let state = load_state(slot);
            let target = if state.is_terminal() {
                SlotState::Empty
            } else {
                SlotState::Error
            };
            if !state.can_transition_to(target) {
                continue;
            }
            match target {
                SlotState::Error => {
                    let message = format!(
                        "{} request expired after its {} ms lease",
                        state,
                        self.lease_ms()
                    );
                    let message = truncate_message(&message, capacity);
                    self.region
                        .write_buffer(index, BufferKind::Result, message.as_bytes());
                    slot.result_len
                        .store(message.len() as u32, Ordering::Relaxed);
                    slot.error_kind
                        .store(ErrorKind::LeaseExpired as u32, Ordering::Relaxed);
                    slot.claimed_by.store(0, Ordering::Relaxed);
                    slot.lease_deadline_ms
                        .store(now_ms.saturating_add(self.lease_ms()), Ordering::Relaxed);
                    slot.state.store(SlotState::Error as u32, Ordering::Release);
                    tracing::warn!(slot = index, generation = handle.generation, %state, "Lease expired");
                    report.expired.push(handle);
                }
                _ => {
                    self.clear_slot(index, slot);
                    tracing::warn!(slot = index, generation = handle.generation, %state, "Reclaimed unconsumed slot");
                    report.reclaimed.push(handle);
                }
            }
        }
        report
    }

    /// Raise the termination flag that workers check every poll.
    pub fn request_shutdown(&self) {
        self.region.header().terminate.store(1, Ordering::Release);
    }

    pub fn clear_shutdown(&self) {
        self.region.header().terminate.store(0, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.region.header().terminate.load(Ordering::Acquire) != 0
    }

    /// Count a worker as attached. Returns the new total.
    pub fn register_worker(&self) -> u32 {
        self.region
            .header()
            .registered_workers
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Undo [`register_worker`](Self::register_worker). Returns the new total.
    pub fn deregister_worker(&self) -> u32 {
        let prev = self
            .region
            .header()
            .registered_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Snapshot counters and per-state slot counts.
    pub fn stats(&self) -> QueueStats {
        let header = self.region.header();
        let layout = self.region.layout();
        let mut states = StateCounts::default();
        for index in 0..layout.slot_count {
            states.bump(load_state(self.region.slot_header(index)));
        }
        QueueStats {
            slot_count: layout.slot_count,
            head: header.head.load(Ordering::Relaxed),
            tail: header.tail.load(Ordering::Relaxed),
            states,
            registered_workers: header.registered_workers.load(Ordering::Relaxed),
            total_claims: header.total_claims.load(Ordering::Relaxed),
            input_capacity: layout.input_capacity,
            operation_capacity: layout.operation_capacity,
            result_capacity: layout.result_capacity,
            lease_ms: header.lease_ms.load(Ordering::Relaxed),
            shutdown_requested: self.shutdown_requested(),
            created_at_ms: header.created_at_ms.load(Ordering::Relaxed),
        }
    }
}

/// A reserved slot being filled by a producer.
///
/// The slot lock is held for the writer's whole life. Dropping it without
/// [`commit`](Self::commit) returns the slot to `EMPTY`.
pub struct SlotWriter<'a> {
    queue: &'a TaskQueue,
    handle: SlotHandle,
    guard: Option<ShmLockGuard<'a>>,
}

impl SlotWriter<'_> {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Copy the request into the slot buffers.
    pub fn write_request(&mut self, input: &[u8], operation: &[u8]) -> Result<()> {
        self.queue.check_request(input.len(), operation.len())?;
        let region = &self.queue.region;
        let slot = region.slot_header(self.handle.index);
        region.write_buffer(self.handle.index, BufferKind::Input, input);
        region.write_buffer(self.handle.index, BufferKind::Operation, operation);
        slot.input_len.store(input.len() as u32, Ordering::Relaxed);
        slot.operation_len
            .store(operation.len() as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Release the slot lock, making the request visible to workers.
    pub fn commit(mut self) -> SlotHandle {
        self.guard.take();
        self.handle
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            let slot = self.queue.region.slot_header(self.handle.index);
            self.queue.clear_slot(self.handle.index, slot);
            tracing::debug!(slot = self.handle.index, "Abandoned uncommitted slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;

    fn queue(slots: u32) -> TaskQueue {
        let config = QueueConfig::default().with_slot_count(slots).with_capacities(
            ByteSize::from_bytes(16),
            ByteSize::from_bytes(8),
            ByteSize::from_bytes(64),
        );
        TaskQueue::anonymous(&config).unwrap()
    }

    fn submit(q: &TaskQueue, input: &[u8], op: &[u8]) -> SlotHandle {
        let mut w = q.acquire_free_slot(input.len()).unwrap();
        w.write_request(input, op).unwrap();
        w.commit()
    }

    fn far_future(q: &TaskQueue) -> u64 {
        now_millis() + q.lease_ms() + 60_000
    }

    #[test]
    fn test_full_cycle() {
        let q = queue(4);
        let h = submit(&q, b"[1,2]", b"sum");
        assert_eq!(q.slot_state(h).unwrap(), SlotState::RequestPending);

        let task = q.claim_pending_slot(0).unwrap();
        assert_eq!(task.handle, h);
        assert_eq!(task.input, b"[1,2]");
        assert_eq!(task.operation, b"sum");
        assert_eq!(q.slot_state(h).unwrap(), SlotState::Claimed);
        assert!(q.claim_pending_slot(1).is_none());

        assert_eq!(
            q.complete(h, Ok(b"3".to_vec())).unwrap(),
            SlotState::ResponseReady
        );
        assert_eq!(q.take_result(h).unwrap(), b"3");
        assert_eq!(q.stats().states.empty, 4);
        assert_eq!(q.stats().total_claims, 1);
    }

    #[test]
    fn test_saturation_rejects_overflow() {
        let q = queue(3);
        let handles: Vec<_> = (0..3).map(|_| submit(&q, b"x", b"y")).collect();
        let err = q.acquire_free_slot(1).err().unwrap();
        assert!(matches!(err, ShmtaskError::QueueSaturated { capacity: 3 }));

        // Nothing got corrupted by the rejected attempt.
        let stats = q.stats();
        assert_eq!(stats.states.request_pending, 3);
        for h in handles {
            assert_eq!(q.slot_state(h).unwrap(), SlotState::RequestPending);
        }
    }

    #[test]
    fn test_tail_advances_in_allocation_order() {
        let q = queue(3);
        let a = submit(&q, b"a", b"");
        let b = submit(&q, b"b", b"");
        assert_eq!((a.index, b.index), (0, 1));

        let task = q.claim_pending_slot(0).unwrap();
        q.complete(task.handle, Ok(vec![])).unwrap();
        q.take_result(a).unwrap();

        // Slot 0 is free again, but allocation continues from the tail.
        assert_eq!(submit(&q, b"c", b"").index, 2);
        assert_eq!(submit(&q, b"d", b"").index, 0);
    }

    #[test]
    fn test_uncommitted_writer_frees_slot() {
        let q = queue(1);
        {
            let mut w = q.acquire_free_slot(2).unwrap();
            w.write_request(b"hi", b"op").unwrap();
        }
        assert_eq!(q.stats().states.empty, 1);
        assert!(q.claim_pending_slot(0).is_none());
        assert!(q.acquire_free_slot(0).is_ok());
    }

    #[test]
    fn test_exact_capacity_fits_and_one_over_fails() {
        let q = queue(2);
        let input = vec![b'a'; 16];
        let op = vec![b'b'; 8];
        let h = submit(&q, &input, &op);
        let task = q.claim_pending_slot(0).unwrap();
        assert_eq!(task.handle, h);
        assert_eq!(task.input, input);
        assert_eq!(task.operation, op);

        let before = q.stats();
        let err = q.acquire_free_slot(17).err().unwrap();
        assert!(matches!(
            err,
            ShmtaskError::PayloadTooLarge {
                buffer: BufferKind::Input,
                len: 17,
                capacity: 16
            }
        ));
        let after = q.stats();
        assert_eq!(before.states, after.states);
        assert_eq!(before.tail, after.tail);

        let mut w = q.acquire_free_slot(0).unwrap();
        let err = w.write_request(b"", &[0; 9]).unwrap_err();
        assert!(matches!(
            err,
            ShmtaskError::PayloadTooLarge {
                buffer: BufferKind::Operation,
                ..
            }
        ));
    }

    #[test]
    fn test_reused_slot_has_no_residual_data() {
        let q = queue(1);
        let h = submit(&q, b"0123456789abcdef", b"longop!!");
        q.claim_pending_slot(0).unwrap();
        q.complete(h, Ok(b"a long result payload".to_vec())).unwrap();
        q.take_result(h).unwrap();

        let region = q.region();
        assert_eq!(region.read_buffer(0, BufferKind::Input, 16), vec![0; 16]);
        assert_eq!(region.read_buffer(0, BufferKind::Operation, 8), vec![0; 8]);
        assert_eq!(region.read_buffer(0, BufferKind::Result, 64), vec![0; 64]);

        let h2 = submit(&q, b"ab", b"x");
        assert_eq!(h2.index, h.index);
        assert_ne!(h2.generation, h.generation);
        let task = q.claim_pending_slot(0).unwrap();
        assert_eq!(task.input, b"ab");
        assert_eq!(task.operation, b"x");
    }

    #[test]
    fn test_stale_handle_is_detected() {
        let q = queue(1);
        let h = submit(&q, b"x", b"");
        q.claim_pending_slot(0).unwrap();
        q.complete(h, Ok(vec![])).unwrap();
        q.take_result(h).unwrap();

        let _h2 = submit(&q, b"y", b"");
        assert!(matches!(
            q.slot_state(h),
            Err(ShmtaskError::SlotLost { .. })
        ));
        assert!(matches!(
            q.complete(h, Ok(vec![])),
            Err(ShmtaskError::SlotLost { .. })
        ));
    }

    #[test]
    fn test_invalid_transitions_leave_slot_unchanged() {
        let q = queue(1);
        let h = submit(&q, b"x", b"");

        let err = q.complete(h, Ok(vec![1])).unwrap_err();
        assert!(matches!(
            err,
            ShmtaskError::InvalidTransition {
                from: SlotState::RequestPending,
                to: SlotState::ResponseReady,
                ..
            }
        ));
        assert!(q.release_slot(h).is_err());
        assert!(q.take_result(h).is_err());
        assert_eq!(q.slot_state(h).unwrap(), SlotState::RequestPending);

        q.claim_pending_slot(0).unwrap();
        q.complete(h, Ok(vec![1])).unwrap();
        assert!(q.complete(h, Err("again".into())).is_err());
        assert_eq!(q.slot_state(h).unwrap(), SlotState::ResponseReady);
    }

    #[test]
    fn test_execution_error_is_returned_and_slot_released() {
        let q = queue(1);
        let h = submit(&q, b"x", b"bad");
        q.claim_pending_slot(0).unwrap();
        assert_eq!(
            q.complete(h, Err("unsupported operation step 'bad'".into()))
                .unwrap(),
            SlotState::Error
        );
        let err = q.take_result(h).unwrap_err();
        match err {
            ShmtaskError::Execution { kind, message } => {
                assert_eq!(kind, ErrorKind::Failed);
                assert_eq!(message, "unsupported operation step 'bad'");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(q.stats().states.empty, 1);
    }

    #[test]
    fn test_oversized_result_becomes_error() {
        let q = queue(1);
        let h = submit(&q, b"x", b"");
        q.claim_pending_slot(0).unwrap();
        assert_eq!(
            q.complete(h, Ok(vec![b'r'; 65])).unwrap(),
            SlotState::Error
        );
        match q.take_result(h).unwrap_err() {
            ShmtaskError::Execution { kind, message } => {
                assert_eq!(kind, ErrorKind::ResultTooLarge);
                assert!(message.starts_with("result of 65 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_long_error_message_truncated_on_char_boundary() {
        assert_eq!(truncate_message("héllo", 2), "h");
        assert_eq!(truncate_message("héllo", 3), "hé");
        assert_eq!(truncate_message("abc", 10), "abc");
    }

    #[test]
    fn test_claim_scans_from_head() {
        let q = queue(4);
        let hs: Vec<_> = (0..3).map(|_| submit(&q, b"x", b"")).collect();
        assert_eq!(q.claim_pending_slot(0).unwrap().handle, hs[0]);
        assert_eq!(q.claim_pending_slot(1).unwrap().handle, hs[1]);
        assert_eq!(q.stats().head, 2);
        assert_eq!(q.claim_pending_slot(0).unwrap().handle, hs[2]);
    }

    #[test]
    fn test_reaper_expires_claimed_but_not_pending() {
        let q = queue(3);
        let claimed = submit(&q, b"c", b"");
        let pending = submit(&q, b"p", b"");
        assert_eq!(q.claim_pending_slot(0).unwrap().handle, claimed);

        let report = q.reap_expired(far_future(&q));
        assert_eq!(report.expired, vec![claimed]);
        assert!(report.reclaimed.is_empty());
        assert_eq!(q.slot_state(claimed).unwrap(), SlotState::Error);

        // A backlogged request keeps waiting for a worker.
        assert_eq!(q.slot_state(pending).unwrap(), SlotState::RequestPending);
        assert!(q.reap_expired(u64::MAX).expired.is_empty());
        assert_eq!(q.claim_pending_slot(1).unwrap().handle, pending);

        // A late worker cannot overwrite the recovered slot.
        assert!(matches!(
            q.complete(claimed, Ok(vec![])),
            Err(ShmtaskError::InvalidTransition { .. })
        ));

        match q.take_result(claimed).unwrap_err() {
            ShmtaskError::Execution { kind, message } => {
                assert_eq!(kind, ErrorKind::LeaseExpired);
                assert!(message.contains("CLAIMED"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reaper_reclaims_unconsumed_results() {
        let q = queue(2);
        let h = submit(&q, b"x", b"");
        q.claim_pending_slot(0).unwrap();
        q.complete(h, Ok(b"done".to_vec())).unwrap();

        assert!(q.reap_expired(now_millis()).is_empty());

        let report = q.reap_expired(far_future(&q));
        assert_eq!(report.reclaimed, vec![h]);
        assert_eq!(q.stats().states.empty, 2);
        assert!(matches!(
            q.take_result(h),
            Err(ShmtaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_reaper_skips_locked_slot() {
        let q = queue(1);
        let h = submit(&q, b"x", b"");
        q.claim_pending_slot(0).unwrap();

        let guard = lock::lock(&q.region.slot_header(h.index).lock);
        assert!(q.reap_expired(far_future(&q)).is_empty());
        drop(guard);
        assert_eq!(q.reap_expired(far_future(&q)).expired, vec![h]);
    }

    #[test]
    fn test_shutdown_flag_and_registration() {
        let q = queue(1);
        assert!(!q.shutdown_requested());
        q.request_shutdown();
        assert!(q.shutdown_requested());
        q.clear_shutdown();
        assert!(!q.shutdown_requested());

        assert_eq!(q.register_worker(), 1);
        assert_eq!(q.register_worker(), 2);
        assert_eq!(q.deregister_worker(), 1);
        assert_eq!(q.deregister_worker(), 0);
        assert_eq!(q.deregister_worker(), 0);
    }

    #[test]
    fn test_stats_serialize() {
        let q = queue(2);
        submit(&q, b"x", b"");
        let json = serde_json::to_value(q.stats()).unwrap();
        assert_eq!(json["slot_count"], 2);
        assert_eq!(json["states"]["request_pending"], 1);
        assert_eq!(json["states"]["empty"], 1);
    }
}
