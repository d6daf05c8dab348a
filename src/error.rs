//! Error types for the pairing service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific pairing scenarios
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Skip rate limited for participant {participant_id}, retry in {retry_after_ms}ms")]
    SkipRateLimited {
        participant_id: String,
        retry_after_ms: u64,
    },

    #[error("Participant already waiting: {participant_id}")]
    AlreadyQueued { participant_id: String },

    #[error("Participant already in a conversation: {participant_id}")]
    AlreadyInConversation { participant_id: String },

    #[error("Participant not found: {participant_id}")]
    ParticipantNotFound { participant_id: String },

    #[error("Username already taken: {username}")]
    UsernameTaken { username: String },

    #[error("Invalid username '{username}': {reason}")]
    InvalidUsername { username: String, reason: String },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl PairingError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, PairingError::SkipRateLimited { .. })
    }
}

/// Find a `PairingError` inside an `anyhow::Error`, if there is one
pub fn pairing_error(err: &anyhow::Error) -> Option<&PairingError> {
    err.downcast_ref::<PairingError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = PairingError::SkipRateLimited {
            participant_id: "p1".to_string(),
            retry_after_ms: 2500,
        };
        assert!(err.is_retryable());
        assert!(!PairingError::InvalidCredentials.is_retryable());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PairingError::UsernameTaken {
            username: "alice".to_string(),
        }
        .into();

        match pairing_error(&err) {
            Some(PairingError::UsernameTaken { username }) => assert_eq!(username, "alice"),
            other => panic!("unexpected error: {:?}", other),
        }

        let plain = anyhow::anyhow!("something else");
        assert!(pairing_error(&plain).is_none());
    }
}
