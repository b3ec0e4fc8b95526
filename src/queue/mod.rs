//! Shared-memory task queue.
//!
//! A fixed ring of task slots in a [`SharedRegion`]. Producers reserve an
//! `EMPTY` slot and write a request, workers claim it and write back a
//! result or error, and the producer consumes the outcome and frees the slot.

mod layout;
mod lock;
mod region;
mod slot;
mod task_queue;

pub use layout::{LAYOUT_VERSION, MAGIC, RegionLayout};
pub use region::SharedRegion;
pub use slot::{ErrorKind, SlotHandle, SlotState};
pub use task_queue::{ClaimedTask, QueueStats, ReapReport, SlotWriter, StateCounts, TaskQueue};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
///
/// Leases are compared across processes, so they use wall time rather than
/// a per-process monotonic clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
