/*
[INPUT]:  Invariant checks, lifecycle transitions, exchange and storage failures
[OUTPUT]: GridError taxonomy used across the engine
[POS]:    Error handling layer - engine-wide error type
[UPDATE]: When adding new failure classes or changing escalation rules
*/

use keygrid_exchange::ExchangeError;
use thiserror::Error;

use crate::slot::{LifecycleAction, LifecycleState, SlotId};

#[derive(Error, Debug)]
pub enum GridError {
    /// Unsorted, duplicate or otherwise malformed slot/price input
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid transition for slot {slot_id}: {from:?} -> {action:?}")]
    InvalidTransition {
        slot_id: SlotId,
        from: LifecycleState,
        action: LifecycleAction,
    },

    #[error("Slot {slot_id} cannot be destroyed: {reason}")]
    DestroyRefused { slot_id: SlotId, reason: String },

    #[error("Unknown slot: {0}")]
    UnknownSlot(SlotId),

    /// Automation halted until an operator clears the alarm
    #[error("Grid is in ALARM: {0}")]
    Alarm(String),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl GridError {
    pub fn is_alarm(&self) -> bool {
        matches!(self, GridError::Alarm(_))
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

/// Storage seams report through anyhow with context; the chain is kept in the message.
impl From<anyhow::Error> for GridError {
    fn from(err: anyhow::Error) -> Self {
        GridError::Persistence(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
