//! Recovery errors.

use super::CheckpointError;
use crate::error::OperationError;
use bastion_types::ErrorCode;
use thiserror::Error;

/// A recovery strategy ran and did not succeed.
///
/// | Variant | Code |
/// |---------|------|
/// | `Exhausted` | `RECOVERY_EXHAUSTED` |
/// | `FallbackFailed` | `RECOVERY_FALLBACK_FAILED` |
/// | `Checkpoint` | `RECOVERY_CHECKPOINT` |
///
/// None are recoverable: the strategy already was the recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Every retry failed; `last` is the final attempt's error.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<OperationError>,
    },

    /// The fallback operation failed.
    #[error("fallback failed: {source}")]
    FallbackFailed {
        #[source]
        source: Box<OperationError>,
    },

    /// Rollback could not load its checkpoint chain.
    #[error("rollback failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl RecoveryError {
    /// The error that ended the strategy, if it came from the operation.
    #[must_use]
    pub fn last_error(&self) -> Option<&OperationError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::FallbackFailed { source } => Some(source),
            Self::Checkpoint(_) => None,
        }
    }
}

impl ErrorCode for RecoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "RECOVERY_EXHAUSTED",
            Self::FallbackFailed { .. } => "RECOVERY_FALLBACK_FAILED",
            Self::Checkpoint(_) => "RECOVERY_CHECKPOINT",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::CircuitOpenError;
    use bastion_types::{assert_error_codes, CheckpointId};
    use std::time::Duration;

    fn open() -> OperationError {
        OperationError::from(CircuitOpenError {
            service: "svc".into(),
            retry_after: Duration::ZERO,
        })
    }

    #[test]
    fn error_codes() {
        assert_error_codes(
            &[
                RecoveryError::Exhausted {
                    attempts: 3,
                    last: Box::new(open()),
                },
                RecoveryError::FallbackFailed {
                    source: Box::new(open()),
                },
                RecoveryError::Checkpoint(CheckpointError::NotFound(CheckpointId::new())),
            ],
            "RECOVERY_",
        );
    }

    #[test]
    fn last_error_exposes_cause() {
        let err = RecoveryError::Exhausted {
            attempts: 2,
            last: Box::new(open()),
        };
        assert!(matches!(err.last_error(), Some(OperationError::CircuitOpen(_))));
        let err = RecoveryError::from(CheckpointError::NotFound(CheckpointId::new()));
        assert!(err.last_error().is_none());
    }
}
