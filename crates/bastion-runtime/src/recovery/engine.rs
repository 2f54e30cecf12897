//! Error enrichment and recovery strategies.

use super::checkpoint::resolve_chain;
use super::retry::{retry, RetryOperation};
use super::{
    classify, Checkpoint, CheckpointError, CheckpointStore, CircuitBreakerRegistry, CircuitState,
    ErrorCategory, ErrorClassification, RecoveryError, RetryPolicy,
};
use crate::error::OperationError;
use crate::sandbox::SandboxManager;
use bastion_auth::{AuditRecord, AuditSink};
use bastion_types::{CheckpointId, CorrelationId, ErrorCode, ErrorId, OperationId, ResourceId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Audit event written for every handled error.
pub const ERROR_HANDLED: &str = "error_handled";
/// Audit event written when a strategy starts.
pub const RECOVERY_ATTEMPTED: &str = "recovery_attempted";
/// Audit event written when a strategy fails.
pub const RECOVERY_FAILED: &str = "recovery_failed";

/// Where an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub operation_id: Option<OperationId>,
    pub correlation_id: CorrelationId,
    /// Downstream service the failed call targeted. Its breaker is charged.
    pub service: Option<String>,
    pub resources: Vec<ResourceId>,
    /// 1-based attempt that failed; 0 if no attempt ran.
    pub attempt: u32,
    /// Checkpoint a rollback could restore.
    pub checkpoint: Option<CheckpointId>,
}

impl ErrorContext {
    /// Context carrying only a correlation id.
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            operation_id: None,
            correlation_id,
            service: None,
            resources: Vec::new(),
            attempt: 0,
            checkpoint: None,
        }
    }

    #[must_use]
    pub fn with_operation(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: Vec<ResourceId>) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointId) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

/// Who acts on a recovery option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// The system can do it unattended.
    Automatic,
    /// The caller can do it with the given hint.
    UserGuided,
    /// Needs an operator.
    Manual,
}

/// One way out of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryOption {
    pub kind: RecoveryKind,
    /// Stable machine name, e.g. `retry`.
    pub action: String,
    pub description: String,
}

impl RecoveryOption {
    fn new(kind: RecoveryKind, action: &str, description: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.to_string(),
            description: description.into(),
        }
    }
}

/// Observable system state when an error was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemSnapshot {
    pub captured_at: DateTime<Utc>,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
    pub checkpoint_count: usize,
    /// `None` when the engine has no sandbox manager attached.
    pub live_sandboxes: Option<usize>,
}

/// Caller-facing error with classification and recovery options.
///
/// Carries only the error's display text and classified fields, never the
/// underlying error value.
#[derive(Debug, Clone, Serialize)]
pub struct EnhancedError {
    pub id: ErrorId,
    pub timestamp: DateTime<Utc>,
    pub code: &'static str,
    pub message: String,
    pub classification: ErrorClassification,
    pub context: ErrorContext,
    pub options: Vec<RecoveryOption>,
    pub snapshot: SystemSnapshot,
}

impl EnhancedError {
    /// Returns `true` if an option of `kind` is offered.
    #[must_use]
    pub fn offers(&self, kind: RecoveryKind) -> bool {
        self.options.iter().any(|o| o.kind == kind)
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.code, self.message, self.id)
    }
}

impl std::error::Error for EnhancedError {}

impl ErrorCode for EnhancedError {
    fn code(&self) -> &'static str {
        self.code
    }

    fn is_recoverable(&self) -> bool {
        self.classification.transient
    }
}

/// How to recover from an error.
pub enum RecoveryStrategy {
    /// Re-run the operation under a retry policy.
    Retry {
        policy: RetryPolicy,
        /// Attempts already made, counted against `policy.max_attempts`.
        attempts_made: u32,
        operation: RetryOperation,
    },
    /// Run an alternate operation once.
    Fallback(BoxFuture<'static, Result<Value, OperationError>>),
    /// Restore a checkpoint.
    Rollback { checkpoint: CheckpointId },
    /// A strategy this engine does not implement.
    Unsupported { kind: String },
}

impl RecoveryStrategy {
    /// Strategy name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Fallback(_) => "fallback",
            Self::Rollback { .. } => "rollback",
            Self::Unsupported { kind } => kind,
        }
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry {
                policy,
                attempts_made,
                ..
            } => f
                .debug_struct("Retry")
                .field("policy", policy)
                .field("attempts_made", attempts_made)
                .finish_non_exhaustive(),
            Self::Fallback(_) => f.write_str("Fallback(..)"),
            Self::Rollback { checkpoint } => {
                f.debug_struct("Rollback").field("checkpoint", checkpoint).finish()
            }
            Self::Unsupported { kind } => f.debug_struct("Unsupported").field("kind", kind).finish(),
        }
    }
}

/// What a strategy achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Retry or fallback produced a value.
    Recovered(Value),
    /// The checkpoint's state, ready to be restored by the caller.
    RolledBack(Value),
    /// The strategy kind is not supported; try another.
    NotAttempted,
}

impl RecoveryOutcome {
    /// `true` only on confirmed success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NotAttempted)
    }
}

/// Classifies errors, keeps checkpoints, and runs recovery strategies.
///
/// # Example
///
/// ```
/// use bastion_auth::MemoryAuditLog;
/// use bastion_runtime::recovery::{
///     BreakerSettings, CircuitBreakerRegistry, ErrorContext, InMemoryCheckpointStore,
///     RecoveryEngine, RetentionPolicy,
/// };
/// use bastion_runtime::sandbox::SandboxError;
/// use bastion_runtime::OperationError;
/// use bastion_types::{CorrelationId, SandboxId};
/// use std::sync::Arc;
///
/// let engine = RecoveryEngine::new(
///     Arc::new(CircuitBreakerRegistry::new(BreakerSettings::default())),
///     Arc::new(InMemoryCheckpointStore::new(RetentionPolicy::default())),
///     Arc::new(MemoryAuditLog::new()),
/// );
/// let err = OperationError::from(SandboxError::NotFound(SandboxId::new("gone")));
/// let enhanced = engine.handle_error(&err, ErrorContext::new(CorrelationId::new()));
/// assert_eq!(enhanced.code, "SANDBOX_NOT_FOUND");
/// assert!(!enhanced.classification.transient);
/// ```
pub struct RecoveryEngine {
    breakers: Arc<CircuitBreakerRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    sandboxes: Option<Arc<SandboxManager>>,
}

impl fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("breakers", &self.breakers)
            .field("checkpoints", &self.checkpoints.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            breakers,
            checkpoints,
            audit,
            sandboxes: None,
        }
    }

    /// Includes the live sandbox count in snapshots.
    #[must_use]
    pub fn with_sandboxes(mut self, sandboxes: Arc<SandboxManager>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Classifies `error` and builds the caller-facing [`EnhancedError`].
    ///
    /// Charges the breaker of `context.service` if set, and writes an
    /// `error_handled` audit record. Never fails.
    pub fn handle_error(&self, error: &OperationError, context: ErrorContext) -> EnhancedError {
        let classification = classify(error);

        if let Some(service) = &context.service {
            self.breakers.record_failure(service);
        }

        let id = ErrorId::new();
        let options = recovery_options(error, &classification, &context);
        let snapshot = self.snapshot();

        self.audit.append(AuditRecord::now(
            ERROR_HANDLED,
            json!({
                "error_id": id.to_string(),
                "code": error.code(),
                "category": classification.category,
                "severity": classification.severity,
                "transient": classification.transient,
                "correlation_id": context.correlation_id.to_string(),
                "operation_id": context.operation_id.map(|op| op.to_string()),
                "service": context.service,
                "attempt": context.attempt,
            }),
        ));
        debug!(
            error_id = %id,
            code = error.code(),
            category = %classification.category,
            transient = classification.transient,
            correlation_id = %context.correlation_id,
            "Error handled"
        );

        EnhancedError {
            id,
            timestamp: Utc::now(),
            code: error.code(),
            message: error.to_string(),
            classification,
            context,
            options,
            snapshot,
        }
    }

    /// Runs `strategy` to recover from `error`.
    ///
    /// Unsupported strategies return [`RecoveryOutcome::NotAttempted`].
    ///
    /// # Errors
    ///
    /// - [`RecoveryError::Exhausted`] with the final attempt's error
    /// - [`RecoveryError::FallbackFailed`] if the fallback fails
    /// - [`RecoveryError::Checkpoint`] if the rollback chain is incomplete
    pub async fn attempt_recovery(
        &self,
        error: OperationError,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let kind = strategy.kind().to_string();
        if let RecoveryStrategy::Unsupported { .. } = strategy {
            debug!(strategy = %kind, "Recovery strategy not supported");
            return Ok(RecoveryOutcome::NotAttempted);
        }

        self.audit.append(AuditRecord::now(
            RECOVERY_ATTEMPTED,
            json!({ "strategy": kind, "code": error.code() }),
        ));

        let result = match strategy {
            RecoveryStrategy::Retry {
                policy,
                attempts_made,
                operation,
            } => retry(&policy, attempts_made, error, operation)
                .await
                .map(|(value, _)| RecoveryOutcome::Recovered(value)),
            RecoveryStrategy::Fallback(fallback) => fallback
                .await
                .map(RecoveryOutcome::Recovered)
                .map_err(|e| RecoveryError::FallbackFailed {
                    source: Box::new(e),
                }),
            RecoveryStrategy::Rollback { checkpoint } => {
                resolve_chain(self.checkpoints.as_ref(), &checkpoint)
                    .map(|cp| RecoveryOutcome::RolledBack(cp.state.clone()))
                    .map_err(RecoveryError::from)
            }
            RecoveryStrategy::Unsupported { .. } => Ok(RecoveryOutcome::NotAttempted),
        };

        match &result {
            Ok(_) => info!(strategy = %kind, "Recovery succeeded"),
            Err(e) => {
                warn!(strategy = %kind, error = %e, "Recovery failed");
                self.audit.append(AuditRecord::now(
                    RECOVERY_FAILED,
                    json!({ "strategy": kind, "code": e.code(), "message": e.to_string() }),
                ));
            }
        }
        result
    }

    /// Stores an independent copy of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Snapshot`] if `state` cannot be serialized.
    pub fn create_checkpoint<T: Serialize + ?Sized>(
        &self,
        operation_id: OperationId,
        state: &T,
    ) -> Result<CheckpointId, CheckpointError> {
        self.create_checkpoint_with_dependencies(operation_id, state, Vec::new())
    }

    /// Stores an independent copy of `state` that builds on `dependencies`.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Snapshot`] if `state` cannot be serialized
    /// - [`CheckpointError::MissingDependency`] if a dependency is absent
    pub fn create_checkpoint_with_dependencies<T: Serialize + ?Sized>(
        &self,
        operation_id: OperationId,
        state: &T,
        dependencies: Vec<CheckpointId>,
    ) -> Result<CheckpointId, CheckpointError> {
        let checkpoint = Checkpoint::capture(operation_id, state, dependencies)?;
        if let Some(missing) = checkpoint
            .dependencies
            .iter()
            .find(|dep| !self.checkpoints.contains(dep))
        {
            return Err(CheckpointError::MissingDependency {
                checkpoint: checkpoint.id,
                dependency: *missing,
            });
        }
        let id = checkpoint.id;
        self.checkpoints.insert(checkpoint)?;
        Ok(id)
    }

    /// Looks up a checkpoint.
    #[must_use]
    pub fn checkpoint(&self, id: &CheckpointId) -> Option<Arc<Checkpoint>> {
        self.checkpoints.get(id)
    }

    /// Captures breaker, checkpoint and sandbox counters.
    #[must_use]
    pub fn snapshot(&self) -> SystemSnapshot {
        let mut open_circuits = Vec::new();
        let mut half_open_circuits = Vec::new();
        for breaker in self.breakers.snapshot() {
            match breaker.state {
                CircuitState::Open => open_circuits.push(breaker.service),
                CircuitState::HalfOpen => half_open_circuits.push(breaker.service),
                CircuitState::Closed => {}
            }
        }
        SystemSnapshot {
            captured_at: Utc::now(),
            open_circuits,
            half_open_circuits,
            checkpoint_count: self.checkpoints.len(),
            live_sandboxes: self.sandboxes.as_ref().map(|s| s.live_count()),
        }
    }
}

fn recovery_options(
    error: &OperationError,
    classification: &ErrorClassification,
    context: &ErrorContext,
) -> Vec<RecoveryOption> {
    use RecoveryKind::{Automatic, Manual, UserGuided};

    let mut options = Vec::new();

    if let OperationError::CircuitOpen(open) = error {
        options.push(RecoveryOption::new(
            Automatic,
            "fallback",
            format!("Use a fallback while '{}' is failing", open.service),
        ));
        options.push(RecoveryOption::new(
            UserGuided,
            "retry_later",
            format!("Retry after {:?}", open.retry_after),
        ));
    } else if classification.transient {
        options.push(RecoveryOption::new(Automatic, "retry", "Retry with backoff"));
    }

    if let Some(checkpoint) = context.checkpoint {
        options.push(RecoveryOption::new(
            Automatic,
            "rollback",
            format!("Restore checkpoint {checkpoint}"),
        ));
    }

    if classification.user_actionable {
        let (action, description) = match classification.category {
            ErrorCategory::Authentication => ("check_credentials", "Re-sign the request with a valid key"),
            ErrorCategory::Authorization => ("request_access", "Request the missing permission or approval"),
            ErrorCategory::Configuration => ("fix_configuration", "Adjust the request to fit the configured limits"),
            ErrorCategory::NotFound => ("verify_identifier", "Check that the referenced id exists"),
            ErrorCategory::Conflict => ("choose_identifier", "Use an identifier that is not in use"),
            ErrorCategory::Lock => ("reacquire_lock", "Acquire the lease again before retrying"),
            ErrorCategory::Checkpoint => ("select_checkpoint", "Choose a checkpoint whose chain is intact"),
            _ => ("review_request", "Review the request and resubmit"),
        };
        options.push(RecoveryOption::new(UserGuided, action, description));
    }

    options.push(RecoveryOption::new(
        Manual,
        "contact_operator",
        "Escalate to an operator with the error id",
    ));
    options
}
