//! Slot states and handles.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of a task slot.
///
/// `EMPTY → REQUEST_PENDING → CLAIMED → RESPONSE_READY | ERROR → EMPTY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum SlotState {
    Empty = 0,
    RequestPending = 1,
    Claimed = 2,
    ResponseReady = 3,
    Error = 4,
}

impl SlotState {
    pub const ALL: [SlotState; 5] = [
        Self::Empty,
        Self::RequestPending,
        Self::Claimed,
        Self::ResponseReady,
        Self::Error,
    ];

    /// Whether a worker has finished with the slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ResponseReady | Self::Error)
    }

    /// Whether `self → next` is an edge of the slot state machine.
    ///
    /// The reaper uses the same edges: an expired claim fails with `ERROR`
    /// and an unconsumed outcome goes back to `EMPTY`. A writer dropped
    /// before committing is not a transition, since nobody saw its request.
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Empty, RequestPending)
                | (RequestPending, Claimed)
                | (Claimed, ResponseReady)
                | (Claimed, Error)
                | (ResponseReady, Empty)
                | (Error, Empty)
        )
    }
}

impl TryFrom<u32> for SlotState {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(Self::Empty),
            1 => Ok(Self::RequestPending),
            2 => Ok(Self::Claimed),
            3 => Ok(Self::ResponseReady),
            4 => Ok(Self::Error),
            other => Err(other),
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "EMPTY",
            Self::RequestPending => "REQUEST_PENDING",
            Self::Claimed => "CLAIMED",
            Self::ResponseReady => "RESPONSE_READY",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Kind of failure recorded in a slot in the `ERROR` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ErrorKind {
    /// The transformation reported an error or the descriptor was malformed.
    Failed = 1,
    /// The result did not fit in the result buffer.
    ResultTooLarge = 2,
    /// Nobody finished the slot before its lease ran out.
    LeaseExpired = 3,
}

impl ErrorKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => Self::ResultTooLarge,
            3 => Self::LeaseExpired,
            _ => Self::Failed,
        }
    }
}

/// Reference to one acquisition of a slot.
///
/// The generation changes every time the slot is handed out, so a handle
/// held past its slot's release is detected rather than acting on the next
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} (gen {})", self.index, self.generation)
    }
}
