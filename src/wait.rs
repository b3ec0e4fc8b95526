//! Waiting for a slot to change state.
//!
//! Waiting is pure polling today. It sits behind [`StateWaiter`] so a
//! blocking primitive (eventfd, futex, semaphore) can replace it without
//! touching the submission path.

use crate::error::Result;
use crate::queue::{SlotHandle, SlotState, TaskQueue};
use std::thread;
use std::time::{Duration, Instant};

/// Blocks until a slot leaves a given state or a timeout passes.
pub trait StateWaiter: Send + Sync {
    /// Wait until the state of `slot` differs from `observed`, or `timeout`
    /// elapses. Returns the state seen last; equal to `observed` on timeout.
    fn wait_for_state_change(
        &self,
        queue: &TaskQueue,
        slot: SlotHandle,
        observed: SlotState,
        timeout: Duration,
    ) -> Result<SlotState>;
}

/// Re-reads the slot state once per interval.
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
    interval: Duration,
}

impl PollingWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for PollingWaiter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_POLL_INTERVAL)
    }
}

impl StateWaiter for PollingWaiter {
    fn wait_for_state_change(
        &self,
        queue: &TaskQueue,
        slot: SlotHandle,
        observed: SlotState,
        timeout: Duration,
    ) -> Result<SlotState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = queue.slot_state(slot)?;
            if state != observed {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(state);
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }
}
