//! Principal → permission lookup.

use crate::Permission;
use bastion_types::Principal;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Read-only lookup of the permissions a principal holds.
///
/// Implementations must be safe to share across threads; lookups are
/// frequent, updates rare.
pub trait PermissionStore: Send + Sync {
    /// Returns every permission issued to `principal`, including expired ones.
    ///
    /// Filtering by expiry and conditions is the caller's job.
    fn permissions_for(&self, principal: &Principal) -> Vec<Permission>;
}

/// Thread-safe, in-memory permission table.
///
/// # Example
///
/// ```
/// use bastion_auth::{Actions, InMemoryPermissionStore, Permission, PermissionStore};
/// use bastion_types::Principal;
///
/// let store = InMemoryPermissionStore::new();
/// let svc = Principal::service("indexer");
/// store.grant(svc.clone(), Permission::new("repo", Actions::READ));
///
/// assert_eq!(store.permissions_for(&svc).len(), 1);
/// assert!(store.permissions_for(&Principal::Anonymous).is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    table: RwLock<HashMap<Principal, Vec<Permission>>>,
}

impl InMemoryPermissionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a permission to a principal.
    pub fn grant(&self, principal: Principal, permission: Permission) {
        tracing::debug!(
            principal = %principal,
            resource = permission.resource(),
            actions = %permission.actions(),
            "permission granted"
        );
        self.table.write().entry(principal).or_default().push(permission);
    }

    /// Removes all permissions of a principal, returning how many were removed.
    pub fn revoke_all(&self, principal: &Principal) -> usize {
        let removed = self
            .table
            .write()
            .remove(principal)
            .map_or(0, |perms| perms.len());
        if removed > 0 {
            tracing::debug!(principal = %principal, removed, "permissions revoked");
        }
        removed
    }

    /// Number of principals with at least one permission.
    #[must_use]
    pub fn principal_count(&self) -> usize {
        self.table.read().len()
    }
}

impl PermissionStore for InMemoryPermissionStore {
    fn permissions_for(&self, principal: &Principal) -> Vec<Permission> {
        self.table.read().get(principal).cloned().unwrap_or_default()
    }
}
