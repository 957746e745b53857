use ulid::Ulid;

use crate::model::{Conflict, RentalStatus};
use crate::payment::PaymentError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed range or missing/invalid fields.
    Validation(String),
    /// Range unavailable, or the atomic re-check lost a race.
    Conflict(Vec<Conflict>),
    Unauthorized {
        actor: String,
        target: Ulid,
    },
    InvalidState {
        id: Ulid,
        status: RentalStatus,
        action: &'static str,
    },
    UpstreamPayment(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::UpstreamPayment(_) => "upstream_payment",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(conflicts) => {
                write!(f, "dates no longer available ({} conflicts)", conflicts.len())
            }
            EngineError::Unauthorized { actor, target } => {
                write!(f, "{actor} is not allowed to act on {target}")
            }
            EngineError::InvalidState { id, status, action } => {
                write!(f, "cannot {action} rental {id}: it is {status}")
            }
            EngineError::UpstreamPayment(e) => write!(f, "payment provider error: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PaymentError> for EngineError {
    fn from(e: PaymentError) -> Self {
        EngineError::UpstreamPayment(e.to_string())
    }
}
