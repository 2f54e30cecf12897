//! Principal (actor identity) types.
//!
//! A [`Principal`] answers "who is asking". What the principal may do is
//! decided by the permission store in `bastion-auth`; this type carries
//! identity only.

use crate::PrincipalId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The actor on whose behalf an operation runs.
///
/// | Variant | Typical Use |
/// |---------|-------------|
/// | `User` | Interactive or API user |
/// | `Service` | Another system calling in with its own credentials |
/// | `Anonymous` | Unsigned legacy clients |
/// | `System` | Internal housekeeping (reapers, pruning) |
///
/// # Example
///
/// ```
/// use bastion_types::{Principal, PrincipalId};
///
/// let user = Principal::User(PrincipalId::new());
/// assert!(user.is_user());
///
/// let svc = Principal::service("billing");
/// assert_eq!(svc.to_string(), "service:billing");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// Human or API user.
    User(PrincipalId),
    /// Named calling service.
    Service(String),
    /// Caller that presented no identity.
    Anonymous,
    /// Internal operations not attributable to a caller.
    System,
}

impl Principal {
    /// Creates a [`Principal::Service`].
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }

    /// Returns `true` for [`Principal::User`].
    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Returns `true` for [`Principal::Anonymous`].
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Returns `true` for [`Principal::System`].
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{id}"),
            Self::Service(name) => write!(f, "service:{name}"),
            Self::Anonymous => f.write_str("anonymous"),
            Self::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn predicates() {
        assert!(Principal::User(PrincipalId::new()).is_user());
        assert!(Principal::Anonymous.is_anonymous());
        assert!(Principal::System.is_system());
        assert!(!Principal::service("x").is_user());
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(Principal::service("a"), 1);
        map.insert(Principal::service("b"), 2);
        assert_eq!(map.get(&Principal::service("a")), Some(&1));
        assert_eq!(map.get(&Principal::Anonymous), None);
    }

    #[test]
    fn serde_roundtrip() {
        let p = Principal::User(PrincipalId::new());
        let json = serde_json::to_string(&p).expect("serialize principal");
        let back: Principal = serde_json::from_str(&json).expect("deserialize principal");
        assert_eq!(p, back);
    }
}
