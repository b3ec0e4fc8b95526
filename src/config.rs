//! Queue and worker pool configuration.
//!
//! All bounds are validated before any shared memory is created. Buffer
//! capacities accept human-readable sizes (e.g., "8K", "64KiB", "65536").

use crate::error::{Result, ShmtaskError};
use crate::transform::TransformKind;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Size of a shared-memory buffer in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(u32);

impl ByteSize {
    pub const fn from_bytes(bytes: u32) -> Self {
        Self(bytes)
    }

    pub const fn from_kib(kib: u32) -> Self {
        Self(kib * 1024)
    }

    pub const fn from_mib(mib: u32) -> Self {
        Self(mib * 1024 * 1024)
    }

    pub const fn as_bytes(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Errors from parsing a [`ByteSize`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ByteSizeError {
    #[error("empty size")]
    Empty,
    #[error("invalid number in size '{0}'")]
    InvalidNumber(String),
    #[error("unknown size suffix '{0}' (expected B, K, KiB, M or MiB)")]
    UnknownSuffix(String),
    #[error("size '{0}' does not fit in 32 bits")]
    Overflow(String),
}

impl FromStr for ByteSize {
    type Err = ByteSizeError;

    /// Plain numbers are bytes. Suffixes are binary and case-insensitive.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ByteSizeError::Empty);
        }

        let num_end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, suffix) = s.split_at(num_end);
        let value: u64 = digits
            .parse()
            .map_err(|_| ByteSizeError::InvalidNumber(s.to_string()))?;

        let multiplier: u64 = match suffix.trim().to_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            other => return Err(ByteSizeError::UnknownSuffix(other.to_string())),
        };

        let bytes = value
            .checked_mul(multiplier)
            .and_then(|b| u32::try_from(b).ok())
            .ok_or_else(|| ByteSizeError::Overflow(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KIB: u32 = 1024;
        const MIB: u32 = 1024 * 1024;
        if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{} MiB", self.0 / MIB)
        } else if self.0 >= KIB && self.0 % KIB == 0 {
            write!(f, "{} KiB", self.0 / KIB)
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Default number of task slots.
pub const DEFAULT_SLOT_COUNT: u32 = 32;
/// Upper bound on task slots.
pub const MAX_SLOT_COUNT: u32 = 1024;

/// Default input buffer capacity (8 KiB).
pub const DEFAULT_INPUT_CAPACITY: ByteSize = ByteSize::from_kib(8);
/// Default operation-descriptor buffer capacity (2 KiB).
pub const DEFAULT_OPERATION_CAPACITY: ByteSize = ByteSize::from_kib(2);
/// Default result buffer capacity (64 KiB).
pub const DEFAULT_RESULT_CAPACITY: ByteSize = ByteSize::from_kib(64);
/// Largest capacity any single buffer may be given.
pub const MAX_BUFFER_CAPACITY: ByteSize = ByteSize::from_mib(16);

/// Default lease before a slot counts as stuck or orphaned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
pub const MIN_LEASE: Duration = Duration::from_millis(10);

/// Default polling interval for waiters and idle workers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_WORKER_COUNT: usize = 1;
pub const MIN_WORKER_COUNT: usize = 1;
pub const MAX_WORKER_COUNT: usize = 16;

/// Polling intervals workers get to observe the termination flag before a hard stop.
pub const DEFAULT_GRACE_INTERVALS: u32 = 100;

/// Respawns allowed per worker before it is left down.
pub const DEFAULT_MAX_RESTARTS: usize = 5;

/// Shape of the shared region. Fixed once the region is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub slot_count: u32,
    pub input_capacity: ByteSize,
    pub operation_capacity: ByteSize,
    pub result_capacity: ByteSize,
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            input_capacity: DEFAULT_INPUT_CAPACITY,
            operation_capacity: DEFAULT_OPERATION_CAPACITY,
            result_capacity: DEFAULT_RESULT_CAPACITY,
            lease: DEFAULT_LEASE,
        }
    }
}

impl QueueConfig {
    pub fn with_slot_count(mut self, slot_count: u32) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_capacities(mut self, input: ByteSize, operation: ByteSize, result: ByteSize) -> Self {
        self.input_capacity = input;
        self.operation_capacity = operation;
        self.result_capacity = result;
        self
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOT_COUNT {
            return Err(ShmtaskError::Config(format!(
                "slot count must be between 1 and {}, got {}",
                MAX_SLOT_COUNT, self.slot_count
            )));
        }
        for (name, cap) in [
            ("input", self.input_capacity),
            ("operation", self.operation_capacity),
            ("result", self.result_capacity),
        ] {
            if cap.as_bytes() == 0 || cap > MAX_BUFFER_CAPACITY {
                return Err(ShmtaskError::Config(format!(
                    "{} capacity must be between 1 byte and {}, got {}",
                    name, MAX_BUFFER_CAPACITY, cap
                )));
            }
        }
        if self.lease < MIN_LEASE {
            return Err(ShmtaskError::Config(format!(
                "lease must be at least {} ms, got {} ms",
                MIN_LEASE.as_millis(),
                self.lease.as_millis()
            )));
        }
        Ok(())
    }
}

/// How workers are hosted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// One OS process per worker, attached to a file-backed region.
    #[default]
    Process,
    /// One thread per worker inside the host process.
    Thread,
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            _ => Err(format!(
                "Unknown worker mode: '{}'. Valid options: process, thread",
                s
            )),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub grace_intervals: u32,
    pub max_restarts: usize,
    pub mode: WorkerMode,
    pub transform: TransformKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_intervals: DEFAULT_GRACE_INTERVALS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            mode: WorkerMode::default(),
            transform: TransformKind::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_transform(mut self, transform: TransformKind) -> Self {
        self.transform = transform;
        self
    }

    /// Reject a transform time limit that a claim's lease would not outlast.
    ///
    /// A worker still inside a slow command when the lease ends would have
    /// its request failed by the reaper.
    pub fn check_lease(&self, lease: Duration) -> Result<()> {
        match self.transform.time_limit() {
            Some(limit) if limit >= lease => Err(ShmtaskError::Config(format!(
                "command timeout of {} ms must be shorter than the {} ms lease",
                limit.as_millis(),
                lease.as_millis()
            ))),
            _ => Ok(()),
        }
    }

    /// Time workers get to exit after the termination flag is raised.
    pub fn grace_period(&self) -> Duration {
        self.poll_interval * self.grace_intervals
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WORKER_COUNT..=MAX_WORKER_COUNT).contains(&self.worker_count) {
            return Err(ShmtaskError::Config(format!(
                "worker count must be between {} and {}, got {}",
                MIN_WORKER_COUNT, MAX_WORKER_COUNT, self.worker_count
            )));
        }
        if self.poll_interval < MIN_POLL_INTERVAL || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(ShmtaskError::Config(format!(
                "poll interval must be between {} ms and {} ms, got {} ms",
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis(),
                self.poll_interval.as_millis()
            )));
        }
        if self.grace_intervals == 0 {
            return Err(ShmtaskError::Config(
                "grace intervals must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
