//! Human-in-the-loop consent boundary.
//!
//! High-risk operations can be held until an external approver answers.
//! How the approver asks (prompt, ticket, chat) is outside Bastion; it only
//! sees a [`ConsentRequest`] going out and a [`ConsentResponse`] coming back.

use async_trait::async_trait;
use bastion_types::{OperationId, Principal, RiskLevel};
use serde::{Deserialize, Serialize};

/// What the approver is asked to decide on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    /// Operation awaiting approval.
    pub operation_id: OperationId,
    /// Caller.
    pub principal: Principal,
    /// Risk level that triggered the request.
    pub risk_level: RiskLevel,
    /// Resources the operation will lock.
    pub resources: Vec<String>,
    /// Human-readable summary.
    pub description: String,
}

/// Approver's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentResponse {
    /// Whether the operation may proceed.
    pub approved: bool,
    /// Optional explanation, surfaced on denial.
    pub reason: Option<String>,
    /// Whether the decision may be reused for later requests of the same
    /// principal at the same or lower risk.
    pub remember: bool,
}

impl ConsentResponse {
    /// One-off approval.
    #[must_use]
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            remember: false,
        }
    }

    /// Approval that may be reused.
    #[must_use]
    pub fn approve_and_remember() -> Self {
        Self {
            remember: true,
            ..Self::approve()
        }
    }

    /// Denial with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            remember: false,
        }
    }
}

/// External approver consulted for high-risk operations.
///
/// Implementations may wait as long as they like; the caller bounds the
/// wait and treats a timeout as denial.
#[async_trait]
pub trait ConsentApprover: Send + Sync {
    /// Asks for a decision.
    async fn request_consent(&self, request: ConsentRequest) -> ConsentResponse;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ConsentApprover for AutoApprove {
    async fn request_consent(&self, _request: ConsentRequest) -> ConsentResponse {
        ConsentResponse::approve()
    }
}

/// Denies everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl ConsentApprover for DenyAll {
    async fn request_consent(&self, request: ConsentRequest) -> ConsentResponse {
        ConsentResponse::deny(format!("{} operations are not permitted", request.risk_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(risk: RiskLevel) -> ConsentRequest {
        ConsentRequest {
            operation_id: OperationId::new(),
            principal: Principal::service("deployer"),
            risk_level: risk,
            resources: vec!["prod-db".into()],
            description: "migrate schema".into(),
        }
    }

    #[tokio::test]
    async fn auto_approve() {
        let resp = AutoApprove.request_consent(request(RiskLevel::Critical)).await;
        assert!(resp.approved);
        assert!(!resp.remember);
    }

    #[tokio::test]
    async fn deny_all_gives_reason() {
        let resp = DenyAll.request_consent(request(RiskLevel::High)).await;
        assert!(!resp.approved);
        assert_eq!(resp.reason.as_deref(), Some("high operations are not permitted"));
    }

    #[test]
    fn remember_variant() {
        let r = ConsentResponse::approve_and_remember();
        assert!(r.approved && r.remember);
    }
}
