//! Identifier types for Bastion.
//!
//! Generated identifiers are random UUID v4 values (122 random bits) and
//! can be minted concurrently on any instance without coordination.
//!
//! Caller-chosen identifiers ([`SandboxId`], [`ResourceId`]) are string
//! newtypes: the caller names the sandbox or resource, Bastion only
//! compares and orders them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a UUID-backed identifier with a display prefix.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new identifier with a random UUID v4.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the inner UUID.
            #[must_use]
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one coordinated operation.
    ///
    /// The same id is used as the lock holder name and as the
    /// `operation_id` of every checkpoint the operation writes.
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_types::OperationId;
    ///
    /// let a = OperationId::new();
    /// let b = OperationId::new();
    /// assert_ne!(a, b);
    /// assert!(a.to_string().starts_with("op:"));
    /// ```
    OperationId,
    "op"
);

uuid_id!(
    /// Links every event, audit record and error of one logical operation.
    ///
    /// A correlation id usually outlives a single [`OperationId`]: an
    /// upstream request that fans out into several operations keeps one
    /// correlation id for all of them.
    CorrelationId,
    "corr"
);

uuid_id!(
    /// Identifier of an immutable checkpoint.
    CheckpointId,
    "ckpt"
);

uuid_id!(
    /// Identifier of a published system event.
    EventId,
    "evt"
);

uuid_id!(
    /// Stable identifier attached to every error returned to a caller.
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_types::ErrorId;
    ///
    /// let id = ErrorId::new();
    /// assert!(id.to_string().starts_with("err:"));
    /// ```
    ErrorId,
    "err"
);

uuid_id!(
    /// Identifier of an EventBus subscription.
    SubscriptionId,
    "sub"
);

uuid_id!(
    /// Identifier of a human or machine user.
    PrincipalId,
    "principal"
);

/// Caller-chosen identifier of a sandbox environment.
///
/// # Example
///
/// ```
/// use bastion_types::SandboxId;
///
/// let named = SandboxId::new("build-42");
/// assert_eq!(named.as_str(), "build-42");
///
/// let generated = SandboxId::generate();
/// assert!(generated.as_str().starts_with("sbx-"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Wraps a caller-chosen name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a unique id of the form `sbx-<uuid>`.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sbx-{}", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Name of a lockable shared resource.
///
/// Ordering is lexicographic on the name; the coordinator relies on it to
/// acquire multi-resource lock sets in a deterministic order.
///
/// # Example
///
/// ```
/// use bastion_types::ResourceId;
///
/// let mut ids = vec![ResourceId::new("b"), ResourceId::new("a")];
/// ids.sort();
/// assert_eq!(ids[0].as_str(), "a");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Wraps a resource name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
