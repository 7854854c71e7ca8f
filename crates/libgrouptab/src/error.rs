use thiserror::Error;

use grouptab_protocol::{ErrorCode, ParticipantId, SessionStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("invalid transition: {event} not allowed while session is {from}")]
    InvalidTransition {
        from: SessionStatus,
        event: &'static str,
    },

    #[error("session is not joinable: session is {0}")]
    SessionNotJoinable(SessionStatus),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("version conflict: expected {expected}, stored version is {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error(
        "spending limit exceeded for {participant_id}: \
         requested {requested_cents} cents, already spent {spent_cents} cents, \
         limit {limit_cents} cents"
    )]
    SpendingLimitExceeded {
        participant_id: ParticipantId,
        requested_cents: u64,
        spent_cents: u64,
        limit_cents: u64,
    },

    #[error("invalid split configuration: {0}")]
    InvalidSplitConfiguration(String),

    #[error("join code space exhausted after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl EngineError {
    /// Convert to a wire error code and caller-safe message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        let code = match self {
            EngineError::SessionNotFound(_)
            | EngineError::ParticipantNotFound(_)
            | EngineError::ItemNotFound(_) => ErrorCode::NotFound,
            EngineError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            EngineError::SessionNotJoinable(_) => ErrorCode::SessionNotJoinable,
            EngineError::CapacityExceeded(_) | EngineError::CodeSpaceExhausted(_) => {
                ErrorCode::CapacityExceeded
            }
            EngineError::Unauthorized(_) => ErrorCode::Unauthorized,
            EngineError::VersionConflict { .. } => ErrorCode::VersionConflict,
            EngineError::SpendingLimitExceeded { .. } => ErrorCode::SpendingLimitExceeded,
            EngineError::InvalidSplitConfiguration(_) => ErrorCode::InvalidSplitConfiguration,
            EngineError::Internal(_) => ErrorCode::Internal,
        };
        match self {
            // Invariant violations are a programming-bug signal; keep the
            // detail in logs, not in the caller-facing message.
            EngineError::Internal(_) => (code, "internal error".to_string()),
            _ => (code, self.to_string()),
        }
    }
}
