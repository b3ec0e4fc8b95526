//! Shared-memory layout of the task queue.
//!
//! Every field that more than one process touches is an atomic, so the
//! region can be read through shared references from any attached process.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Region header (128 bytes): magic, version, geometry,        │
//! │  init/terminate flags, queue lock, head, tail, counters      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Slot 0: header (64 bytes) │ input │ operation │ result │ pad │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Slot 1 ...                                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::config::QueueConfig;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic bytes identifying a shmtask region.
pub const MAGIC: u64 = u64::from_le_bytes(*b"SHMTASK\0");

/// Layout version; bumped whenever a field moves.
pub const LAYOUT_VERSION: u32 = 1;

/// `init_state` before the creator has finished writing the header.
pub const INIT_PENDING: u32 = 0;
/// `init_state` once the header is complete and the region is usable.
pub const INIT_READY: u32 = 1;

/// Alignment of the header and of every slot.
pub const CACHE_LINE: usize = 64;

/// Region header at offset 0.
#[repr(C, align(64))]
pub struct RegionHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub slot_count: AtomicU32,
    pub input_capacity: AtomicU32,
    pub operation_capacity: AtomicU32,
    pub result_capacity: AtomicU32,
    pub lease_ms: AtomicU32,
    /// Published last, with release ordering.
    pub init_state: AtomicU32,
    /// Non-zero once shutdown has been requested.
    pub terminate: AtomicU32,
    /// Owner pid of the queue-level lock, zero when free.
    pub queue_lock: AtomicU32,
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub registered_workers: AtomicU32,
    pub total_claims: AtomicU64,
    pub created_at_ms: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == 128);

/// Per-slot metadata, followed in memory by the slot's three buffers.
#[repr(C, align(64))]
pub struct SlotHeader {
    /// Owner pid of the slot lock, zero when free.
    pub lock: AtomicU32,
    pub state: AtomicU32,
    pub generation: AtomicU32,
    pub error_kind: AtomicU32,
    pub input_len: AtomicU32,
    pub operation_len: AtomicU32,
    pub result_len: AtomicU32,
    /// Worker id + 1 of the current claimant, zero when unclaimed.
    pub claimed_by: AtomicU32,
    /// Wall-clock milliseconds; zero means no lease.
    pub lease_deadline_ms: AtomicU64,
    pub claims: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == CACHE_LINE);

pub const HEADER_SIZE: usize = std::mem::size_of::<RegionHeader>();
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

/// Geometry of a region: how many slots and how big each buffer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub slot_count: u32,
    pub input_capacity: u32,
    pub operation_capacity: u32,
    pub result_capacity: u32,
}

impl RegionLayout {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            slot_count: config.slot_count,
            input_capacity: config.input_capacity.as_bytes(),
            operation_capacity: config.operation_capacity.as_bytes(),
            result_capacity: config.result_capacity.as_bytes(),
        }
    }

    /// Bytes from one slot header to the next, rounded up to a cache line.
    pub fn slot_stride(&self) -> usize {
        let raw = SLOT_HEADER_SIZE
            + self.input_capacity as usize
            + self.operation_capacity as usize
            + self.result_capacity as usize;
        raw.div_ceil(CACHE_LINE) * CACHE_LINE
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.slot_stride() * self.slot_count as usize
    }

    pub fn slot_offset(&self, index: u32) -> usize {
        HEADER_SIZE + self.slot_stride() * index as usize
    }

    pub fn input_offset(&self, index: u32) -> usize {
        self.slot_offset(index) + SLOT_HEADER_SIZE
    }

    pub fn operation_offset(&self, index: u32) -> usize {
        self.input_offset(index) + self.input_capacity as usize
    }

    pub fn result_offset(&self, index: u32) -> usize {
        self.operation_offset(index) + self.operation_capacity as usize
    }
}
