use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    /// The requested interval overlaps these active reservations.
    #[error("interval overlaps active reservation(s): {0:?}")]
    Conflict(Vec<Ulid>),

    #[error("hold {0} expired before it was confirmed")]
    Expired(Ulid),

    #[error("resource {0} is inactive")]
    Inactive(Ulid),

    #[error("reservation {id} is {status}: {reason}")]
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
        reason: &'static str,
    },

    /// The resource lock could not be taken in time. Safe to retry.
    #[error("resource {0} is busy, retry later")]
    Busy(Ulid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("WAL error: {0}")]
    WalError(String),
}

/// Caller-facing error taxonomy. Per-date recurring failures are reported as these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    Expired,
    Inactive,
    NotFound,
    InvalidState,
    Busy,
    ValidationError,
    Storage,
}

impl ErrorKind {
    /// Only lock contention is worth an automatic retry.
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Busy
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) | EngineError::Validation(_) => {
                ErrorKind::ValidationError
            }
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Expired(_) => ErrorKind::Expired,
            EngineError::Inactive(_) => ErrorKind::Inactive,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::Busy(_) => ErrorKind::Busy,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
