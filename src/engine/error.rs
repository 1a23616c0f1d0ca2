use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, Stamp};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Target or buffer slot already taken. The caller should offer another time.
    #[error("slot unavailable: {0}")]
    SlotUnavailable(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("appointment {0} is already confirmed")]
    AlreadyConfirmed(Ulid),
    #[error("appointment {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("appointment {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("a slot already exists at {0}")]
    SlotExists(Stamp),
    #[error("slot {0} is in use")]
    SlotInUse(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// WAL append or flush failed; nothing was applied.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotUnavailable(_) => "slot_unavailable",
            Self::NotFound(_) => "not_found",
            Self::AlreadyConfirmed(_) => "already_confirmed",
            Self::AlreadyCancelled(_) => "already_cancelled",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SlotExists(_) => "slot_exists",
            Self::SlotInUse(_) => "slot_in_use",
            Self::InvalidInput(_) => "invalid_input",
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::Persistence(_) => "persistence",
        }
    }
}
