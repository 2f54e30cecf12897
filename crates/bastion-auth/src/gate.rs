//! Authentication gate.
//!
//! # Decision Flow
//!
//! ```text
//! InboundMessage
//!     │
//!     ├─ no signature ──────────► degrade: {read:public}, medium, audit
//!     │
//!     ├─ unknown algorithm ─────► audit + AuthError::UnknownAlgorithm
//!     ├─ verify() == false ─────► audit + AuthError::InvalidSignature
//!     │
//!     └─ verified ──► resolve permissions (drop expired / unmet conditions)
//!                        └─► risk = max action risk, audit = any audited
//! ```
//!
//! Unsigned callers are not rejected: they are served as
//! [`Principal::Anonymous`] with the public read grant only, and every such
//! request is flagged for audit.

use crate::{
    Actions, AuditRecord, AuditSink, AuthError, MessageSignature, Permission, PermissionStore,
    SignatureAlgorithm, SignatureVerifier,
};
use bastion_types::{Principal, RiskLevel};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Audit event name for rejected authentication attempts.
pub const AUTHENTICATION_FAILED: &str = "authentication_failed";

/// A request as seen by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Claimed identity.
    pub principal: Principal,
    /// Signed bytes.
    pub payload: Vec<u8>,
    /// Signature, absent for legacy unsigned clients.
    pub signature: Option<MessageSignature>,
    /// Request attributes matched by permission conditions.
    pub attributes: HashMap<String, String>,
}

impl InboundMessage {
    /// Creates an unsigned message.
    #[must_use]
    pub fn unsigned(principal: Principal, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            principal,
            payload: payload.into(),
            signature: None,
            attributes: HashMap::new(),
        }
    }

    /// Creates a signed message.
    #[must_use]
    pub fn signed(
        principal: Principal,
        payload: impl Into<Vec<u8>>,
        signature: MessageSignature,
    ) -> Self {
        Self {
            signature: Some(signature),
            ..Self::unsigned(principal, payload)
        }
    }

    /// Adds a request attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a successful authentication. Lives for one request only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    /// Always `true` on the success path, including the unsigned degrade.
    pub authenticated: bool,
    /// Identity the request runs as.
    pub principal: Principal,
    /// Granted `"<action>:<resource>"` strings.
    pub permissions: Vec<String>,
    /// Derived risk.
    pub risk_level: RiskLevel,
    /// Whether the request must be audited.
    pub requires_audit: bool,
    resolved: Vec<Permission>,
}

impl AuthenticationResult {
    fn from_permissions(principal: Principal, resolved: Vec<Permission>) -> Self {
        let actions = resolved
            .iter()
            .fold(Actions::empty(), |acc, p| acc | p.actions());
        Self {
            authenticated: true,
            principal,
            permissions: resolved.iter().flat_map(Permission::to_grants).collect(),
            risk_level: actions.risk_level(),
            requires_audit: resolved.iter().any(Permission::audit_required),
            resolved,
        }
    }

    /// Returns `true` if some resolved permission covers `actions` on `resource`.
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_auth::{
    ///     Actions, AuthenticationGate, InMemoryPermissionStore, InboundMessage, MemoryAuditLog,
    ///     SignatureAlgorithm,
    /// };
    /// use bastion_types::Principal;
    /// use std::sync::Arc;
    ///
    /// let gate = AuthenticationGate::new(
    ///     Arc::new(InMemoryPermissionStore::new()),
    ///     Arc::new(|_: SignatureAlgorithm, _: &[u8], _: &[u8], _: &[u8]| true),
    ///     Arc::new(MemoryAuditLog::new()),
    /// );
    /// let result = gate
    ///     .authenticate(&InboundMessage::unsigned(Principal::service("legacy"), "ping"))
    ///     .expect("unsigned requests degrade");
    /// assert!(result.permits("public", Actions::READ));
    /// assert!(!result.permits("public", Actions::WRITE));
    /// ```
    #[must_use]
    pub fn permits(&self, resource: &str, actions: Actions) -> bool {
        self.resolved
            .iter()
            .filter(|p| p.applies_to(resource))
            .fold(Actions::empty(), |granted, p| granted | p.actions())
            .contains(actions)
    }

    /// Resolved permissions behind [`permissions`](Self::permissions).
    #[must_use]
    pub fn resolved(&self) -> &[Permission] {
        &self.resolved
    }
}

/// Verifies signatures, resolves permissions and assigns risk.
pub struct AuthenticationGate {
    store: Arc<dyn PermissionStore>,
    verifier: Arc<dyn SignatureVerifier>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuthenticationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationGate").finish_non_exhaustive()
    }
}

impl AuthenticationGate {
    /// Creates a gate over a permission store, verifier and audit sink.
    #[must_use]
    pub fn new(
        store: Arc<dyn PermissionStore>,
        verifier: Arc<dyn SignatureVerifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            verifier,
            audit,
        }
    }

    /// The sink failures are written to.
    #[must_use]
    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Authenticates one message.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownAlgorithm`] if a signature carries an unrecognized tag
    /// - [`AuthError::InvalidSignature`] if a signature fails verification
    ///
    /// Each failure appends exactly one `authentication_failed` audit record.
    /// An absent signature is not an error.
    pub fn authenticate(&self, message: &InboundMessage) -> Result<AuthenticationResult, AuthError> {
        let Some(signature) = &message.signature else {
            tracing::debug!(claimed = %message.principal, "unsigned request, degrading to public read");
            let mut result =
                AuthenticationResult::from_permissions(Principal::Anonymous, vec![Permission::public_read()]);
            result.requires_audit = true;
            return Ok(result);
        };

        let algorithm = match signature.algorithm.parse::<SignatureAlgorithm>() {
            Ok(alg) => alg,
            Err(err) => {
                self.record_failure(message, &err);
                return Err(err);
            }
        };

        let valid = self.verifier.verify(
            algorithm,
            &signature.public_key,
            &signature.signature,
            &message.payload,
        );
        if !valid {
            let err = AuthError::InvalidSignature {
                principal: message.principal.clone(),
            };
            self.record_failure(message, &err);
            return Err(err);
        }

        let now = Utc::now();
        let resolved: Vec<Permission> = self
            .store
            .permissions_for(&message.principal)
            .into_iter()
            .filter(|p| p.is_active(now, &message.attributes))
            .collect();
        let result = AuthenticationResult::from_permissions(message.principal.clone(), resolved);

        tracing::debug!(
            principal = %result.principal,
            %algorithm,
            risk = %result.risk_level,
            grants = result.permissions.len(),
            "request authenticated"
        );
        Ok(result)
    }

    fn record_failure(&self, message: &InboundMessage, err: &AuthError) {
        tracing::warn!(principal = %message.principal, reason = err.reason(), "authentication failed");
        self.audit.append(AuditRecord::now(
            AUTHENTICATION_FAILED,
            json!({
                "principal": message.principal.to_string(),
                "reason": err.reason(),
                "algorithm": message.signature.as_ref().map(|s| s.algorithm.as_str()),
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Condition, InMemoryPermissionStore, MemoryAuditLog};
    use chrono::Duration;

    fn accept_ok(_: SignatureAlgorithm, _: &[u8], sig: &[u8], _: &[u8]) -> bool {
        sig == b"ok"
    }

    fn setup() -> (AuthenticationGate, Arc<InMemoryPermissionStore>, Arc<MemoryAuditLog>) {
        let store = Arc::new(InMemoryPermissionStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let gate = AuthenticationGate::new(store.clone(), Arc::new(accept_ok), audit.clone());
        (gate, store, audit)
    }

    fn signed(principal: Principal, sig: &[u8]) -> InboundMessage {
        InboundMessage::signed(principal, "payload", MessageSignature::new("EdDSA", b"pk".to_vec(), sig.to_vec()))
    }

    #[test]
    fn signed_without_permissions_is_medium() {
        let (gate, _, audit) = setup();
        let r = gate
            .authenticate(&signed(Principal::service("a"), b"ok"))
            .expect("valid signature");
        assert!(r.authenticated);
        assert!(r.permissions.is_empty());
        assert_eq!(r.risk_level, RiskLevel::Medium);
        assert!(!r.requires_audit);
        assert!(audit.is_empty());
    }

    #[test]
    fn expired_permissions_not_resolved() {
        let (gate, store, _) = setup();
        let p = Principal::service("a");
        store.grant(
            p.clone(),
            Permission::new("job", Actions::EXECUTE).expires_at(Utc::now() - Duration::seconds(1)),
        );
        store.grant(p.clone(), Permission::new("repo", Actions::READ));
        let r = gate.authenticate(&signed(p, b"ok")).expect("valid signature");
        assert_eq!(r.permissions, vec!["read:repo"]);
        assert_eq!(r.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn conditions_use_message_attributes() {
        let (gate, store, _) = setup();
        let p = Principal::service("a");
        store.grant(
            p.clone(),
            Permission::new("repo", Actions::WRITE).with_condition(Condition::Attribute {
                key: "env".into(),
                value: "staging".into(),
            }),
        );
        let without = gate.authenticate(&signed(p.clone(), b"ok")).expect("valid");
        assert!(without.permissions.is_empty());

        let with = gate
            .authenticate(&signed(p, b"ok").with_attribute("env", "staging"))
            .expect("valid");
        assert_eq!(with.risk_level, RiskLevel::High);
    }

    #[test]
    fn unknown_algorithm_is_audited() {
        let (gate, _, audit) = setup();
        let msg = InboundMessage::signed(
            Principal::service("a"),
            "p",
            MessageSignature::new("HS256", b"k".to_vec(), b"ok".to_vec()),
        );
        let err = gate.authenticate(&msg).expect_err("unknown algorithm");
        assert_eq!(err.reason(), "unknown_algorithm");
        assert_eq!(audit.count_event(AUTHENTICATION_FAILED), 1);
    }

    #[test]
    fn audit_details_omit_key_material() {
        let (gate, _, audit) = setup();
        let _ = gate.authenticate(&signed(Principal::service("a"), b"bad"));
        let record = &audit.records()[0];
        assert_eq!(record.details["reason"], "invalid_signature");
        assert!(record.details.get("public_key").is_none());
        assert!(record.details.get("signature").is_none());
    }
}
