//! Error types for shmtask.

use crate::queue::{ErrorKind, SlotHandle, SlotState};
use thiserror::Error;

/// Which fixed-capacity buffer a payload was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Input,
    Operation,
    Result,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Operation => write!(f, "operation"),
            Self::Result => write!(f, "result"),
        }
    }
}

/// Main error type for shmtask.
#[derive(Error, Debug)]
pub enum ShmtaskError {
    #[error("{buffer} payload of {len} bytes exceeds the {capacity}-byte {buffer} buffer")]
    PayloadTooLarge {
        buffer: BufferKind,
        len: usize,
        capacity: usize,
    },

    #[error("Task queue saturated: all {capacity} slots are in use, retry later")]
    QueueSaturated { capacity: usize },

    #[error("{message}")]
    Execution { kind: ErrorKind, message: String },

    #[error("Wait for {slot} was cancelled; the slot is left to the lease reaper")]
    Cancelled { slot: SlotHandle },

    #[error("Gave up waiting for {slot} after {waited_ms} ms")]
    Timeout { slot: SlotHandle, waited_ms: u64 },

    #[error("{slot} was recycled before its result was consumed")]
    SlotLost { slot: SlotHandle },

    #[error("Rejected transition of {slot} from {from} to {to}")]
    InvalidTransition {
        slot: SlotHandle,
        from: SlotState,
        to: SlotState,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shared region error: {0}")]
    Region(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShmtaskError {
    /// Whether the same request may succeed if submitted again later.
    ///
    /// Saturation and timeouts are transient; execution errors and oversized
    /// payloads will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueSaturated { .. } | Self::Timeout { .. } | Self::SlotLost { .. }
        ) || matches!(
            self,
            Self::Execution {
                kind: ErrorKind::LeaseExpired,
                ..
            }
        )
    }

    /// Whether the error came from the transformation rather than the queue.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Execution { .. } => 2,
            Self::QueueSaturated { .. } => 3,
            Self::PayloadTooLarge { .. } => 4,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}

/// Result type alias for shmtask operations.
pub type Result<T> = std::result::Result<T, ShmtaskError>;
