//! Error Taxonomy
//!
//! Every rejected request leaves session state unchanged, except that lazy
//! clock resolution may already have finished the session (`ClockExpired`).

use thiserror::Error;
use uuid::Uuid;

use crate::game::session::SessionStatus;
use crate::network::protocol::ErrorCode;

/// Errors produced by the engines, the session manager and the client agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// Malformed or illegal request. Reported to the acting client only.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Request does not fit the current state. Client should re-fetch.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Status machine refused a transition.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },

    /// The acting side's clock ran out before the request was considered.
    #[error("clock expired, session finished on time")]
    ClockExpired,

    /// Session does not exist.
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// Actor is not seated in the session.
    #[error("{0} is not a participant of this session")]
    NotParticipant(String),

    /// Server asked the client to back off.
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited {
        /// Explicit retry hint.
        retry_after_ms: u64,
    },

    /// Point transfer could not be applied.
    #[error("settlement failed: {0}")]
    Settlement(String),

    /// Request never reached the server or the reply was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected server-side failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GameError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GameError::Validation(_) => ErrorCode::InvalidInput,
            GameError::StateConflict(_) => ErrorCode::StateConflict,
            GameError::InvalidTransition { .. } => ErrorCode::InvalidStatusTransition,
            GameError::ClockExpired => ErrorCode::ClockExpired,
            GameError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            GameError::NotParticipant(_) => ErrorCode::NotParticipant,
            GameError::RateLimited { .. } => ErrorCode::RateLimited,
            GameError::Settlement(_) => ErrorCode::SettlementFailed,
            GameError::Transport(_) | GameError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the client should re-fetch the authoritative snapshot.
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            GameError::StateConflict(_) | GameError::InvalidTransition { .. } | GameError::ClockExpired
        )
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GameError::Transport(_) | GameError::Settlement(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GameError::ClockExpired.code(), ErrorCode::ClockExpired);
        assert_eq!(
            GameError::RateLimited { retry_after_ms: 5_000 }.code(),
            ErrorCode::RateLimited
        );
        assert!(GameError::StateConflict("turn".into()).needs_refresh());
        assert!(!GameError::Validation("square".into()).needs_refresh());
        assert!(GameError::Transport("reset".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = GameError::InvalidTransition {
            from: SessionStatus::Finished,
            to: SessionStatus::Active,
        };
        assert_eq!(err.to_string(), "invalid status transition finished -> active");
    }
}
