//! Runtime-wide error type.
//!
//! Every component error folds into [`OperationError`], which is what the
//! recovery engine classifies and what the coordinator propagates before it
//! is enriched into an [`EnhancedError`](crate::recovery::EnhancedError).

use crate::config::ConfigError;
use crate::lock::LockError;
use crate::recovery::{CheckpointError, CircuitOpenError, RecoveryError};
use crate::sandbox::SandboxError;
use bastion_auth::AuthError;
use bastion_event::EventError;
use bastion_types::ErrorCode;
use thiserror::Error;

/// Any error raised while coordinating an operation.
///
/// `code()` and `is_recoverable()` delegate to the wrapped error.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Event(#[from] EventError),
}

impl ErrorCode for OperationError {
    fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Sandbox(e) => e.code(),
            Self::CircuitOpen(e) => e.code(),
            Self::Lock(e) => e.code(),
            Self::Checkpoint(e) => e.code(),
            Self::Recovery(e) => e.code(),
            Self::Config(e) => e.code(),
            Self::Event(e) => e.code(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_recoverable(),
            Self::Sandbox(e) => e.is_recoverable(),
            Self::CircuitOpen(e) => e.is_recoverable(),
            Self::Lock(e) => e.is_recoverable(),
            Self::Checkpoint(e) => e.is_recoverable(),
            Self::Recovery(e) => e.is_recoverable(),
            Self::Config(e) => e.is_recoverable(),
            Self::Event(e) => e.is_recoverable(),
        }
    }
}
