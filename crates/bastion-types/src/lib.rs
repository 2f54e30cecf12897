//! Core types for Bastion.
//!
//! Bastion is a trust-and-resilience pipeline placed in front of a
//! tool-invoking request/response engine. This crate holds the
//! vocabulary every other crate shares.
//!
//! # Crate Architecture
//!
//! ```text
//! bastion-types   (IDs, Principal, RiskLevel, ErrorCode)   ◄── HERE
//!     ↑               ↑
//! bastion-event   bastion-auth
//! (SystemEvent)   (Permission, AuthenticationGate, audit)
//!     ↑               ↑
//!     bastion-runtime
//!     (sandbox, recovery, locks, eventbus, coordinator)
//! ```
//!
//! # Example
//!
//! ```
//! use bastion_types::{CorrelationId, OperationId, Principal, ResourceId};
//!
//! let op = OperationId::new();
//! let corr = CorrelationId::new();
//! let who = Principal::service("indexer");
//! let what = ResourceId::new("repo/main");
//! assert_ne!(op.uuid(), corr.uuid());
//! assert_eq!(what.as_str(), "repo/main");
//! assert!(!who.is_anonymous());
//! ```

mod error;
mod id;
mod principal;
mod risk;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{
    CheckpointId, CorrelationId, ErrorId, EventId, OperationId, PrincipalId, ResourceId,
    SandboxId, SubscriptionId,
};
pub use principal::Principal;
pub use risk::RiskLevel;
