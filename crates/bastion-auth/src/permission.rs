//! Permissions held by principals.
//!
//! A [`Permission`] is immutable once issued: all fields are private and the
//! builder methods consume `self`. Revocation removes permissions from the
//! store, it never edits them in place.

use crate::Actions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource name that matches every resource.
pub const ANY_RESOURCE: &str = "*";

/// Resource granted to unsigned callers.
pub const PUBLIC_RESOURCE: &str = "public";

/// Extra constraint a permission carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Valid only inside a time window (either bound may be open).
    TimeWindow {
        /// Inclusive start.
        not_before: Option<DateTime<Utc>>,
        /// Exclusive end.
        not_after: Option<DateTime<Utc>>,
    },
    /// Valid only if the request carries `key = value`.
    Attribute {
        /// Attribute name.
        key: String,
        /// Required value.
        value: String,
    },
}

impl Condition {
    /// Evaluates the condition against the request time and attributes.
    #[must_use]
    pub fn holds(&self, now: DateTime<Utc>, attributes: &HashMap<String, String>) -> bool {
        match self {
            Self::TimeWindow {
                not_before,
                not_after,
            } => {
                not_before.map_or(true, |start| now >= start)
                    && not_after.map_or(true, |end| now < end)
            }
            Self::Attribute { key, value } => attributes.get(key) == Some(value),
        }
    }
}

/// A grant of actions on one resource.
///
/// # Example
///
/// ```
/// use bastion_auth::{Actions, Permission};
///
/// let p = Permission::new("repo/main", Actions::READ | Actions::WRITE).audited();
/// assert!(p.audit_required());
/// assert_eq!(p.to_grants(), vec!["read:repo/main", "write:repo/main"]);
/// assert!(p.covers("repo/main", Actions::WRITE));
/// assert!(!p.covers("repo/other", Actions::READ));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    resource: String,
    actions: Actions,
    #[serde(default)]
    audit_required: bool,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

impl Permission {
    /// Creates a permission without audit, expiry or conditions.
    #[must_use]
    pub fn new(resource: impl Into<String>, actions: Actions) -> Self {
        Self {
            resource: resource.into(),
            actions,
            audit_required: false,
            expiration: None,
            conditions: Vec::new(),
        }
    }

    /// The `read:public` permission granted to unsigned callers.
    #[must_use]
    pub fn public_read() -> Self {
        Self::new(PUBLIC_RESOURCE, Actions::READ)
    }

    /// Marks use of this permission as requiring an audit trail.
    #[must_use]
    pub fn audited(mut self) -> Self {
        self.audit_required = true;
        self
    }

    /// Sets the expiration time.
    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiration = Some(at);
        self
    }

    /// Adds a condition.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Resource name, or [`ANY_RESOURCE`].
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Granted actions.
    #[must_use]
    pub fn actions(&self) -> Actions {
        self.actions
    }

    /// Whether use must be audited.
    #[must_use]
    pub fn audit_required(&self) -> bool {
        self.audit_required
    }

    /// Expiration time, if any.
    #[must_use]
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Attached conditions.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns `true` if `expiration <= now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }

    /// Returns `true` if not expired and every condition holds.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, attributes: &HashMap<String, String>) -> bool {
        !self.is_expired(now) && self.conditions.iter().all(|c| c.holds(now, attributes))
    }

    /// Returns `true` if this permission is scoped to `resource`, directly
    /// or through [`ANY_RESOURCE`].
    #[must_use]
    pub fn applies_to(&self, resource: &str) -> bool {
        self.resource == ANY_RESOURCE || self.resource == resource
    }

    /// Returns `true` if this permission alone grants all of `actions` on
    /// `resource`.
    #[must_use]
    pub fn covers(&self, resource: &str, actions: Actions) -> bool {
        self.applies_to(resource) && self.actions.contains(actions)
    }

    /// Renders `"<action>:<resource>"` strings, one per action.
    #[must_use]
    pub fn to_grants(&self) -> Vec<String> {
        self.actions
            .names()
            .into_iter()
            .map(|action| format!("{action}:{}", self.resource))
            .collect()
    }
}
