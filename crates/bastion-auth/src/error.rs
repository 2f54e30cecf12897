//! Authentication and authorization errors.

use crate::Actions;
use bastion_types::{ErrorCode, Principal};
use thiserror::Error;

/// Errors raised by the authentication gate and the consent boundary.
///
/// None of these are recoverable: retrying the same request yields the
/// same answer.
///
/// # Error Codes
///
/// | Variant | Code | Reason |
/// |---------|------|--------|
/// | `InvalidSignature` | `AUTH_INVALID_SIGNATURE` | `invalid_signature` |
/// | `UnknownAlgorithm` | `AUTH_UNKNOWN_ALGORITHM` | `unknown_algorithm` |
/// | `Unauthorized` | `AUTH_UNAUTHORIZED` | `unauthorized` |
/// | `ConsentDenied` | `AUTH_CONSENT_DENIED` | `consent_denied` |
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A signature was present but did not verify.
    #[error("invalid signature for {principal}")]
    InvalidSignature {
        /// Claimed identity.
        principal: Principal,
    },

    /// A signature was present with an unrecognized algorithm tag.
    #[error("unknown signature algorithm '{tag}'")]
    UnknownAlgorithm {
        /// The tag as sent.
        tag: String,
    },

    /// Resolved permissions do not cover the requested actions.
    #[error("{principal} lacks {required} on '{resource}'")]
    Unauthorized {
        /// Caller.
        principal: Principal,
        /// Resource the caller asked for.
        resource: String,
        /// Actions that were required.
        required: Actions,
    },

    /// The external approver refused (or did not answer in time).
    #[error("consent denied for {principal}: {reason}")]
    ConsentDenied {
        /// Caller.
        principal: Principal,
        /// Approver's reason.
        reason: String,
    },
}

impl AuthError {
    /// Short machine reason, e.g. `"invalid_signature"`.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::UnknownAlgorithm { .. } => "unknown_algorithm",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ConsentDenied { .. } => "consent_denied",
        }
    }
}

impl ErrorCode for AuthError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature { .. } => "AUTH_INVALID_SIGNATURE",
            Self::UnknownAlgorithm { .. } => "AUTH_UNKNOWN_ALGORITHM",
            Self::Unauthorized { .. } => "AUTH_UNAUTHORIZED",
            Self::ConsentDenied { .. } => "AUTH_CONSENT_DENIED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}
