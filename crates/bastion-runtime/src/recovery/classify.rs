//! Error classification.
//!
//! Every [`OperationError`] maps to an [`ErrorClassification`]. Typed
//! errors classify by variant; task failures carry only a message and are
//! classified by [`classify_message`]. Nothing here can fail: unrecognised
//! input lands in [`ErrorCategory::Unknown`].

use crate::error::OperationError;
use crate::lock::LockError;
use crate::recovery::{CheckpointError, RecoveryError};
use crate::sandbox::SandboxError;
use bastion_auth::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Configuration,
    Conflict,
    NotFound,
    Timeout,
    CircuitOpen,
    Lock,
    Checkpoint,
    Execution,
    Network,
    Unknown,
}

impl ErrorCategory {
    /// snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Configuration => "configuration",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Lock => "lock",
            Self::Checkpoint => "checkpoint",
            Self::Execution => "execution",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad the failure is for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    /// A retry of the same call may succeed.
    pub transient: bool,
    /// The caller can fix the cause (credentials, config, input).
    pub user_actionable: bool,
}

impl ErrorClassification {
    const fn new(
        category: ErrorCategory,
        severity: Severity,
        transient: bool,
        user_actionable: bool,
    ) -> Self {
        Self {
            category,
            severity,
            transient,
            user_actionable,
        }
    }

    /// Fallback for anything that cannot be classified.
    pub const UNKNOWN: Self = Self::new(ErrorCategory::Unknown, Severity::Medium, false, false);
}

/// Classifies a free-form failure message.
///
/// Returns the category and whether the failure looks transient.
///
/// ```
/// use bastion_runtime::recovery::{classify_message, ErrorCategory};
///
/// assert_eq!(classify_message("upstream timed out"), (ErrorCategory::Timeout, true));
/// assert_eq!(classify_message("Connection reset by peer"), (ErrorCategory::Network, true));
/// assert_eq!(classify_message("schema mismatch"), (ErrorCategory::Unknown, false));
/// ```
#[must_use]
pub fn classify_message(msg: &str) -> (ErrorCategory, bool) {
    let lower = msg.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out", "deadline exceeded"]) {
        (ErrorCategory::Timeout, true)
    } else if has(&[
        "connection reset",
        "connection refused",
        "connection closed",
        "broken pipe",
        "unreachable",
        "dns",
        "temporarily unavailable",
        "service unavailable",
        "too many requests",
        "rate limit",
        "try again",
    ]) {
        (ErrorCategory::Network, true)
    } else if has(&["unauthorized", "unauthenticated", "invalid token"]) {
        (ErrorCategory::Authentication, false)
    } else if has(&["permission denied", "forbidden", "access denied"]) {
        (ErrorCategory::Authorization, false)
    } else if has(&["not found", "no such"]) {
        (ErrorCategory::NotFound, false)
    } else if has(&["already exists", "conflict"]) {
        (ErrorCategory::Conflict, false)
    } else if has(&["invalid", "malformed", "panicked"]) {
        (ErrorCategory::Execution, false)
    } else {
        (ErrorCategory::Unknown, false)
    }
}

/// Classifies an operation error.
#[must_use]
pub fn classify(error: &OperationError) -> ErrorClassification {
    use ErrorCategory as C;
    use Severity as S;

    match error {
        OperationError::Auth(e) => match e {
            AuthError::InvalidSignature { .. } | AuthError::UnknownAlgorithm { .. } => {
                ErrorClassification::new(C::Authentication, S::High, false, true)
            }
            AuthError::Unauthorized { .. } | AuthError::ConsentDenied { .. } => {
                ErrorClassification::new(C::Authorization, S::Medium, false, true)
            }
        },
        OperationError::Sandbox(e) => classify_sandbox(e),
        OperationError::CircuitOpen(_) => {
            ErrorClassification::new(C::CircuitOpen, S::Medium, true, false)
        }
        OperationError::Lock(e) => match e {
            LockError::Conflict { .. } | LockError::Timeout { .. } => {
                ErrorClassification::new(C::Lock, S::Low, true, false)
            }
            LockError::NotHolder { .. }
            | LockError::NotRenewable { .. }
            | LockError::InvalidLease { .. } => {
                ErrorClassification::new(C::Lock, S::Medium, false, true)
            }
        },
        OperationError::Checkpoint(e) => classify_checkpoint(e),
        OperationError::Recovery(e) => match e {
            RecoveryError::Exhausted { last, .. } => ErrorClassification {
                severity: S::High,
                transient: false,
                ..classify(last)
            },
            RecoveryError::FallbackFailed { .. } => {
                ErrorClassification::new(C::Execution, S::High, false, false)
            }
            RecoveryError::Checkpoint(inner) => classify_checkpoint(inner),
        },
        OperationError::Config(_) => {
            ErrorClassification::new(C::Configuration, S::Medium, false, true)
        }
        OperationError::Event(_) => {
            ErrorClassification::new(C::Configuration, S::Low, false, true)
        }
    }
}

fn classify_sandbox(e: &SandboxError) -> ErrorClassification {
    use ErrorCategory as C;
    use Severity as S;

    match e {
        SandboxError::InvalidConfig(_)
        | SandboxError::LimitExceeded { .. }
        | SandboxError::CapabilityDenied { .. }
        | SandboxError::PathDenied { .. } => {
            ErrorClassification::new(C::Configuration, S::Medium, false, true)
        }
        SandboxError::Conflict(_) => ErrorClassification::new(C::Conflict, S::Low, false, true),
        SandboxError::NotFound(_) => ErrorClassification::new(C::NotFound, S::Low, false, true),
        SandboxError::Timeout { .. } => ErrorClassification::new(C::Timeout, S::Medium, true, false),
        SandboxError::CapacityExhausted { .. } | SandboxError::Busy(_) => {
            ErrorClassification::new(C::Conflict, S::Medium, true, false)
        }
        SandboxError::Backend(_) => ErrorClassification::new(C::Execution, S::High, true, false),
        SandboxError::TaskFailed { source, .. } => {
            let (category, _) = classify_message(source.message());
            let category = if category == C::Unknown { C::Execution } else { category };
            ErrorClassification::new(category, S::Medium, source.is_transient(), false)
        }
    }
}

fn classify_checkpoint(e: &CheckpointError) -> ErrorClassification {
    match e {
        CheckpointError::NotFound(_) | CheckpointError::MissingDependency { .. } => {
            ErrorClassification::new(ErrorCategory::Checkpoint, Severity::High, false, true)
        }
        CheckpointError::Snapshot(_) => {
            ErrorClassification::new(ErrorCategory::Checkpoint, Severity::Medium, false, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::CircuitOpenError;
    use crate::sandbox::TaskError;
    use bastion_auth::Actions;
    use bastion_types::{CheckpointId, Principal, ResourceId, SandboxId};
    use std::time::Duration;

    #[test]
    fn message_heuristics() {
        assert_eq!(classify_message("request TIMED OUT"), (ErrorCategory::Timeout, true));
        assert_eq!(classify_message("connection refused"), (ErrorCategory::Network, true));
        assert_eq!(classify_message("429 Too Many Requests"), (ErrorCategory::Network, true));
        assert_eq!(classify_message("permission denied"), (ErrorCategory::Authorization, false));
        assert_eq!(classify_message("file not found"), (ErrorCategory::NotFound, false));
        assert_eq!(classify_message("invalid input"), (ErrorCategory::Execution, false));
        assert_eq!(classify_message("???"), (ErrorCategory::Unknown, false));
    }

    #[test]
    fn invalid_signature_is_permanent() {
        let c = classify(&OperationError::from(AuthError::InvalidSignature {
            principal: Principal::Anonymous,
        }));
        assert_eq!(c.category, ErrorCategory::Authentication);
        assert!(!c.transient);
        assert!(c.user_actionable);
    }

    #[test]
    fn unauthorized_is_authorization() {
        let c = classify(&OperationError::from(AuthError::Unauthorized {
            principal: Principal::service("x"),
            resource: "db".into(),
            required: Actions::WRITE,
        }));
        assert_eq!(c.category, ErrorCategory::Authorization);
    }

    #[test]
    fn sandbox_timeout_is_transient() {
        let c = classify(&OperationError::from(SandboxError::Timeout {
            sandbox: SandboxId::new("s"),
            limit: Duration::from_secs(1),
        }));
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert!(c.transient);
    }

    #[test]
    fn task_failure_uses_task_hint() {
        let failed = |source| {
            classify(&OperationError::from(SandboxError::TaskFailed {
                sandbox: SandboxId::new("s"),
                task: "t".into(),
                source,
            }))
        };
        let flaky = failed(TaskError::new("connection reset by peer"));
        assert_eq!(flaky.category, ErrorCategory::Network);
        assert!(flaky.transient);

        let opaque = failed(TaskError::transient("weird"));
        assert_eq!(opaque.category, ErrorCategory::Execution);
        assert!(opaque.transient);
    }

    #[test]
    fn circuit_open_is_transient_not_actionable() {
        let c = classify(&OperationError::from(CircuitOpenError {
            service: "svc".into(),
            retry_after: Duration::from_secs(1),
        }));
        assert_eq!(c.category, ErrorCategory::CircuitOpen);
        assert!(c.transient);
        assert!(!c.user_actionable);
    }

    #[test]
    fn lock_conflict_vs_not_holder() {
        let conflict = classify(&OperationError::from(LockError::Conflict {
            resource: ResourceId::new("r"),
            held_by: "a".into(),
            retry_after: Duration::from_secs(1),
        }));
        assert!(conflict.transient);
        let stale = classify(&OperationError::from(LockError::NotHolder {
            resource: ResourceId::new("r"),
            holder: "b".into(),
        }));
        assert!(!stale.transient);
        assert_eq!(stale.category, ErrorCategory::Lock);
    }

    #[test]
    fn exhausted_retry_is_not_transient() {
        let last = OperationError::from(SandboxError::Timeout {
            sandbox: SandboxId::new("s"),
            limit: Duration::from_secs(1),
        });
        let c = classify(&OperationError::from(RecoveryError::Exhausted {
            attempts: 3,
            last: Box::new(last),
        }));
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert_eq!(c.severity, Severity::High);
        assert!(!c.transient);
    }

    #[test]
    fn checkpoint_not_found() {
        let c = classify(&OperationError::from(CheckpointError::NotFound(CheckpointId::new())));
        assert_eq!(c.category, ErrorCategory::Checkpoint);
        assert!(!c.transient);
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::CircuitOpen).expect("serialize");
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
    }
}
