//! Sandbox errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`SandboxError::InvalidConfig`] | `SANDBOX_INVALID_CONFIG` | No |
//! | [`SandboxError::Conflict`] | `SANDBOX_CONFLICT` | No |
//! | [`SandboxError::NotFound`] | `SANDBOX_NOT_FOUND` | No |
//! | [`SandboxError::Timeout`] | `SANDBOX_TIMEOUT` | Yes |
//! | [`SandboxError::LimitExceeded`] | `SANDBOX_LIMIT_EXCEEDED` | No |
//! | [`SandboxError::CapabilityDenied`] | `SANDBOX_CAPABILITY_DENIED` | No |
//! | [`SandboxError::PathDenied`] | `SANDBOX_PATH_DENIED` | No |
//! | [`SandboxError::CapacityExhausted`] | `SANDBOX_CAPACITY_EXHAUSTED` | Yes |
//! | [`SandboxError::Busy`] | `SANDBOX_BUSY` | Yes |
//! | [`SandboxError::Backend`] | `SANDBOX_BACKEND` | Yes |
//! | [`SandboxError::TaskFailed`] | `SANDBOX_TASK_FAILED` | task-defined |

use super::TaskError;
use bastion_auth::Actions;
use bastion_types::{ErrorCode, SandboxId};
use std::time::Duration;
use thiserror::Error;

/// Sandbox lifecycle and execution errors.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// Requested limits exceed the system-wide caps.
    #[error("invalid sandbox config: {0}")]
    InvalidConfig(String),

    /// A sandbox with this id is already registered.
    #[error("sandbox already exists: {0}")]
    Conflict(SandboxId),

    /// No sandbox with this id is registered.
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// Execution exceeded the wall-clock limit; the sandbox was torn down.
    #[error("sandbox {sandbox} timed out after {limit:?}")]
    Timeout { sandbox: SandboxId, limit: Duration },

    /// A task declared a resource demand above the sandbox limits.
    #[error("sandbox {sandbox}: {resource} demand {demand} exceeds limit {limit}")]
    LimitExceeded {
        sandbox: SandboxId,
        resource: &'static str,
        demand: u64,
        limit: u64,
    },

    /// A task requires capabilities the sandbox does not grant.
    #[error("sandbox {sandbox}: task requires {required}, sandbox grants {granted}")]
    CapabilityDenied {
        sandbox: SandboxId,
        required: Actions,
        granted: Actions,
    },

    /// A path lies outside the filesystem policy.
    #[error("path '{path}' denied: {reason}")]
    PathDenied { path: String, reason: String },

    /// The live-sandbox cap is reached.
    #[error("sandbox capacity exhausted ({max} live)")]
    CapacityExhausted { max: usize },

    /// The sandbox is already executing (or still initializing).
    #[error("sandbox busy: {0}")]
    Busy(SandboxId),

    /// The isolation backend failed.
    #[error("isolation backend error: {0}")]
    Backend(String),

    /// The task ran and returned an error.
    #[error("task '{task}' failed in {sandbox}: {source}")]
    TaskFailed {
        sandbox: SandboxId,
        task: String,
        #[source]
        source: TaskError,
    },
}

impl ErrorCode for SandboxError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "SANDBOX_INVALID_CONFIG",
            Self::Conflict(_) => "SANDBOX_CONFLICT",
            Self::NotFound(_) => "SANDBOX_NOT_FOUND",
            Self::Timeout { .. } => "SANDBOX_TIMEOUT",
            Self::LimitExceeded { .. } => "SANDBOX_LIMIT_EXCEEDED",
            Self::CapabilityDenied { .. } => "SANDBOX_CAPABILITY_DENIED",
            Self::PathDenied { .. } => "SANDBOX_PATH_DENIED",
            Self::CapacityExhausted { .. } => "SANDBOX_CAPACITY_EXHAUSTED",
            Self::Busy(_) => "SANDBOX_BUSY",
            Self::Backend(_) => "SANDBOX_BACKEND",
            Self::TaskFailed { .. } => "SANDBOX_TASK_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::CapacityExhausted { .. }
            | Self::Busy(_)
            | Self::Backend(_) => true,
            Self::TaskFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_types::assert_error_codes;

    fn all_variants() -> Vec<SandboxError> {
        let id = SandboxId::new("sbx");
        vec![
            SandboxError::InvalidConfig("x".into()),
            SandboxError::Conflict(id.clone()),
            SandboxError::NotFound(id.clone()),
            SandboxError::Timeout {
                sandbox: id.clone(),
                limit: Duration::from_secs(1),
            },
            SandboxError::LimitExceeded {
                sandbox: id.clone(),
                resource: "memory_mb",
                demand: 2,
                limit: 1,
            },
            SandboxError::CapabilityDenied {
                sandbox: id.clone(),
                required: Actions::EXECUTE,
                granted: Actions::READ,
            },
            SandboxError::PathDenied {
                path: "/etc".into(),
                reason: "outside".into(),
            },
            SandboxError::CapacityExhausted { max: 1 },
            SandboxError::Busy(id.clone()),
            SandboxError::Backend("x".into()),
            SandboxError::TaskFailed {
                sandbox: id,
                task: "t".into(),
                source: TaskError::new("boom"),
            },
        ]
    }

    #[test]
    fn all_error_codes_valid() {
        assert_error_codes(&all_variants(), "SANDBOX_");
    }

    #[test]
    fn caller_misuse_not_recoverable() {
        assert!(!SandboxError::InvalidConfig("x".into()).is_recoverable());
        assert!(!SandboxError::NotFound(SandboxId::new("a")).is_recoverable());
        assert!(SandboxError::Timeout {
            sandbox: SandboxId::new("a"),
            limit: Duration::from_secs(1)
        }
        .is_recoverable());
    }

    #[test]
    fn task_failure_recoverability_follows_task() {
        let failed = |source| SandboxError::TaskFailed {
            sandbox: SandboxId::new("a"),
            task: "t".into(),
            source,
        };
        assert!(failed(TaskError::transient("flaky")).is_recoverable());
        assert!(!failed(TaskError::permanent("bad input")).is_recoverable());
    }
}
