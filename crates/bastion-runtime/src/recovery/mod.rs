//! Failure handling: classification, circuit breakers, checkpoints, and
//! recovery strategies.
//!
//! # Flow
//!
//! ```text
//! OperationError ──► RecoveryEngine::handle_error ──► EnhancedError
//!                        │  classify()                  (id, classification,
//!                        │  CircuitBreakerRegistry        options, snapshot)
//!                        └─► AuditSink
//!
//! RecoveryStrategy ──► RecoveryEngine::attempt_recovery
//!   Retry     ── RetryPolicy (exponential / linear / fixed)
//!   Fallback  ── alternate future
//!   Rollback  ── CheckpointStore
//! ```
//!
//! # Automatic Recovery
//!
//! Only errors classified `transient` are retried automatically. Everything
//! else goes back to the caller as an [`EnhancedError`] whose
//! [`RecoveryOption`]s say what a human or upstream system can do.

mod breaker;
mod checkpoint;
mod classify;
mod engine;
mod error;
mod retry;

pub use breaker::{
    BreakerSettings, BreakerSnapshot, CallPermit, CircuitBreakerRegistry, CircuitOpenError,
    CircuitState,
};
pub use checkpoint::{
    resolve_chain, Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore,
    RetentionPolicy,
};
pub use classify::{classify, classify_message, ErrorCategory, ErrorClassification, Severity};
pub use engine::{
    EnhancedError, ErrorContext, RecoveryEngine, RecoveryKind, RecoveryOption, RecoveryOutcome,
    RecoveryStrategy, SystemSnapshot, ERROR_HANDLED, RECOVERY_ATTEMPTED, RECOVERY_FAILED,
};
pub use error::RecoveryError;
pub use retry::{Backoff, RetryOperation, RetryPolicy};
