//! Bastion Runtime - execution, recovery and coordination.
//!
//! Everything between an authenticated request and its result: sandboxed
//! execution, failure classification and recovery, resource leasing, event
//! delivery, and the coordinator that strings them together.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  bastion-types  : ids, Principal, RiskLevel, ErrorCode      │
//! │  bastion-event  : SystemEvent, EventPattern                 │
//! │  bastion-auth   : AuthenticationGate, audit, consent        │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Runtime Layer (THIS CRATE)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  sandbox/     : SandboxManager, IsolationBackend            │
//! │  recovery/    : CircuitBreakerRegistry, RecoveryEngine      │
//! │  lock         : LockManager (leases, fencing tokens)        │
//! │  eventbus     : EventBus (pattern pub/sub)                  │
//! │  coordinator  : OperationCoordinator                        │
//! │  config/      : BastionConfig, ConfigLoader                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! ## [`coordinator`] - Orchestration
//!
//! - [`OperationCoordinator`]: authenticate, lock, execute, publish, recover
//! - [`CoordinatorBuilder`]: wires components from [`BastionConfig`]
//!
//! ## [`sandbox`] - Isolated Execution
//!
//! - [`SandboxManager`](sandbox::SandboxManager): lifecycle, limits, timeouts
//! - [`IsolationBackend`](sandbox::IsolationBackend): external backend seam
//!
//! ## [`recovery`] - Failure Handling
//!
//! - [`RecoveryEngine`](recovery::RecoveryEngine): classification, retry,
//!   fallback, rollback
//! - [`CircuitBreakerRegistry`](recovery::CircuitBreakerRegistry): per-service breakers
//!
//! ## [`lock`] - Leases
//!
//! - [`LockManager`](lock::LockManager): shared/exclusive leases with expiry
//!
//! ## [`eventbus`] - Notification
//!
//! - [`EventBus`](eventbus::EventBus): ordered, isolated per-subscriber delivery
//!
//! # Errors
//!
//! Component errors fold into [`OperationError`]; callers of the
//! coordinator receive an [`EnhancedError`](recovery::EnhancedError) with a
//! stable id, classification and recovery options.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod eventbus;
pub mod lock;
pub mod recovery;
pub mod sandbox;

pub use config::{BastionConfig, ConfigError, ConfigLoader};
pub use coordinator::{
    CoordinatorBuilder, OperationCoordinator, OperationOutcome, OperationRequest, SandboxProfile,
};
pub use error::OperationError;
pub use eventbus::{EventBus, EventHandler, Subscription};
pub use lock::{LockError, LockManager, LockRequest, LockType, ResourceLock};
pub use recovery::{EnhancedError, ErrorContext, RecoveryEngine};
pub use sandbox::{SandboxError, SandboxManager, SandboxTask};
