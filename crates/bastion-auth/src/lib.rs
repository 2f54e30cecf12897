//! Authentication, authorization and audit for Bastion.
//!
//! # Overview
//!
//! ```text
//! InboundMessage ──► AuthenticationGate ──► AuthenticationResult
//!                      │      │     │            (principal, grants, risk)
//!                      │      │     └─► AuditSink (failures)
//!                      │      └─► SignatureVerifier (external)
//!                      └─► PermissionStore
//! ```
//!
//! High-risk results may additionally be routed through a
//! [`ConsentApprover`] before the operation proceeds.
//!
//! # Example
//!
//! ```
//! use bastion_auth::{
//!     Actions, AuthenticationGate, InMemoryPermissionStore, InboundMessage, MemoryAuditLog,
//!     MessageSignature, Permission, SignatureAlgorithm,
//! };
//! use bastion_types::{Principal, RiskLevel};
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryPermissionStore::new());
//! let ci = Principal::service("ci");
//! store.grant(ci.clone(), Permission::new("build", Actions::EXECUTE).audited());
//!
//! let gate = AuthenticationGate::new(
//!     store,
//!     Arc::new(|_: SignatureAlgorithm, _: &[u8], sig: &[u8], _: &[u8]| sig == b"good"),
//!     Arc::new(MemoryAuditLog::new()),
//! );
//!
//! let msg = InboundMessage::signed(ci, "run", MessageSignature::new("EdDSA", vec![1], b"good".to_vec()));
//! let result = gate.authenticate(&msg).expect("signature verifies");
//! assert_eq!(result.risk_level, RiskLevel::Critical);
//! assert!(result.requires_audit);
//! assert_eq!(result.permissions, vec!["execute:build"]);
//! ```

mod actions;
mod audit;
mod consent;
mod error;
mod gate;
mod permission;
mod store;
mod verifier;

pub use actions::Actions;
pub use audit::{AuditRecord, AuditSink, MemoryAuditLog, TracingAuditSink, DEFAULT_AUDIT_CAPACITY};
pub use consent::{AutoApprove, ConsentApprover, ConsentRequest, ConsentResponse, DenyAll};
pub use error::AuthError;
pub use gate::{AuthenticationGate, AuthenticationResult, InboundMessage, AUTHENTICATION_FAILED};
pub use permission::{Condition, Permission, ANY_RESOURCE, PUBLIC_RESOURCE};
pub use store::{InMemoryPermissionStore, PermissionStore};
pub use verifier::{MessageSignature, SignatureAlgorithm, SignatureVerifier};
