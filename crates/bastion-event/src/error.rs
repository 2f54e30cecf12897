//! Event layer errors.

use bastion_types::ErrorCode;
use thiserror::Error;

/// Errors raised while building events or subscription patterns.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// The subscription pattern is not a valid glob.
    #[error("invalid event pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Parser message.
        reason: String,
    },

    /// Event types must be non-empty.
    #[error("event type must not be empty")]
    EmptyType,
}

impl ErrorCode for EventError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidPattern { .. } => "EVENT_INVALID_PATTERN",
            Self::EmptyType => "EVENT_EMPTY_TYPE",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}
