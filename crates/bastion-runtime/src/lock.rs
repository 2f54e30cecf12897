//! Leased resource locks.
//!
//! A lock is a lease: it expires at `expires_at` whether or not the holder
//! releases it. Expired leases are dropped lazily on the next acquisition
//! of the same resource, and eagerly by [`LockManager::reap_expired`] or
//! the background reaper.
//!
//! # Compatibility
//!
//! | Held \ Requested | Shared | Exclusive |
//! |------------------|--------|-----------|
//! | Shared | ✓ | ✗ |
//! | Exclusive | ✗ | ✗ |
//!
//! A holder has at most one lease per resource; a second request from the
//! same holder conflicts.
//!
//! # Fencing
//!
//! Every grant carries a `fencing_token` that increases across the whole
//! manager. Stores that remember the highest token they have seen can
//! reject writes from a holder whose lease was reassigned.

use bastion_types::{ErrorCode, ResourceId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lease mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    /// Returns `true` if a lease of `self` may coexist with one of `other`.
    #[must_use]
    pub fn compatible_with(self, other: LockType) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// A request for a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource_id: ResourceId,
    pub lock_type: LockType,
    pub holder: String,
    /// Lease length. `None` uses the manager default.
    pub lease: Option<Duration>,
    pub renewable: bool,
}

impl LockRequest {
    /// Renewable exclusive lease with the default length.
    #[must_use]
    pub fn exclusive(resource_id: impl Into<ResourceId>, holder: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            lock_type: LockType::Exclusive,
            holder: holder.into(),
            lease: None,
            renewable: true,
        }
    }

    /// Renewable shared lease with the default length.
    #[must_use]
    pub fn shared(resource_id: impl Into<ResourceId>, holder: impl Into<String>) -> Self {
        Self {
            lock_type: LockType::Shared,
            ..Self::exclusive(resource_id, holder)
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    #[must_use]
    pub fn non_renewable(mut self) -> Self {
        self.renewable = false;
        self
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    pub resource_id: ResourceId,
    pub lock_type: LockType,
    pub holder: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
    /// Length of each (re)grant.
    pub lease: Duration,
    pub renewable: bool,
    pub fencing_token: u64,
}

impl ResourceLock {
    /// Returns `true` once `now` reaches `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Lock errors.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | `Conflict` | `LOCK_CONFLICT` | Yes |
/// | `NotHolder` | `LOCK_NOT_HOLDER` | No |
/// | `Timeout` | `LOCK_TIMEOUT` | Yes |
/// | `NotRenewable` | `LOCK_NOT_RENEWABLE` | No |
/// | `InvalidLease` | `LOCK_INVALID_LEASE` | No |
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// An incompatible live lease exists.
    #[error("resource '{resource}' is locked by '{held_by}' (retry after {retry_after:?})")]
    Conflict {
        resource: ResourceId,
        held_by: String,
        retry_after: Duration,
    },

    /// The caller holds no live lease on the resource.
    #[error("'{holder}' does not hold a lease on '{resource}'")]
    NotHolder { resource: ResourceId, holder: String },

    /// Bounded acquisition gave up.
    #[error("timed out after {waited:?} waiting for '{resource}'")]
    Timeout { resource: ResourceId, waited: Duration },

    /// The lease was granted as non-renewable.
    #[error("lease on '{resource}' held by '{holder}' is not renewable")]
    NotRenewable { resource: ResourceId, holder: String },

    /// A zero-length lease was requested.
    #[error("lease on '{resource}' must be longer than zero")]
    InvalidLease { resource: ResourceId },
}

impl ErrorCode for LockError {
    fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "LOCK_CONFLICT",
            Self::NotHolder { .. } => "LOCK_NOT_HOLDER",
            Self::Timeout { .. } => "LOCK_TIMEOUT",
            Self::NotRenewable { .. } => "LOCK_NOT_RENEWABLE",
            Self::InvalidLease { .. } => "LOCK_INVALID_LEASE",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout { .. })
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub granted: u64,
    pub released: u64,
    pub renewed: u64,
    /// Leases dropped because they expired.
    pub reaped: u64,
}

/// Grants, renews and reclaims leases.
///
/// The lock table is sharded by resource; grants for one resource are
/// linearizable and unrelated resources never contend.
///
/// # Example
///
/// ```
/// use bastion_runtime::lock::{LockError, LockManager, LockRequest};
/// use std::time::Duration;
///
/// let locks = LockManager::new(Duration::from_secs(300));
/// let lease = locks.acquire(LockRequest::exclusive("orders", "op-a")).expect("free");
/// let err = locks.acquire(LockRequest::shared("orders", "op-b")).expect_err("held");
/// assert!(matches!(err, LockError::Conflict { .. }));
///
/// locks.release(&lease.resource_id, "op-a").expect("holder releases");
/// locks.acquire(LockRequest::shared("orders", "op-b")).expect("free again");
/// ```
#[derive(Debug)]
pub struct LockManager {
    default_lease: Duration,
    table: DashMap<ResourceId, Vec<ResourceLock>>,
    next_token: AtomicU64,
    changed: Notify,
    granted: AtomicU64,
    released: AtomicU64,
    renewed: AtomicU64,
    reaped: AtomicU64,
}

impl LockManager {
    /// Creates a manager whose requests default to `default_lease`.
    #[must_use]
    pub fn new(default_lease: Duration) -> Self {
        Self {
            default_lease,
            table: DashMap::new(),
            next_token: AtomicU64::new(0),
            changed: Notify::new(),
            granted: AtomicU64::new(0),
            released: AtomicU64::new(0),
            renewed: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Grants a lease or fails fast.
    ///
    /// # Errors
    ///
    /// - [`LockError::Conflict`] if an incompatible live lease exists
    /// - [`LockError::InvalidLease`] for a zero-length lease
    pub fn acquire(&self, request: LockRequest) -> Result<ResourceLock, LockError> {
        let lease = request.lease.unwrap_or(self.default_lease);
        if lease.is_zero() {
            return Err(LockError::InvalidLease {
                resource: request.resource_id,
            });
        }

        let now = Instant::now();
        let mut entry = self.table.entry(request.resource_id.clone()).or_default();

        let before = entry.len();
        entry.retain(|lock| !lock.is_expired(now));
        let expired = before - entry.len();
        if expired > 0 {
            self.reaped.fetch_add(expired as u64, Ordering::Relaxed);
            debug!(resource = %request.resource_id, expired, "Dropped expired leases");
        }

        let blocking = entry
            .iter()
            .filter(|held| held.holder == request.holder || !held.lock_type.compatible_with(request.lock_type))
            .max_by_key(|held| held.expires_at);
        if let Some(held) = blocking {
            return Err(LockError::Conflict {
                resource: request.resource_id,
                held_by: held.holder.clone(),
                retry_after: held.expires_at.saturating_duration_since(now),
            });
        }

        let lock = ResourceLock {
            resource_id: request.resource_id,
            lock_type: request.lock_type,
            holder: request.holder,
            acquired_at: now,
            expires_at: now + lease,
            lease,
            renewable: request.renewable,
            fencing_token: self.next_token.fetch_add(1, Ordering::SeqCst) + 1,
        };
        entry.push(lock.clone());
        self.granted.fetch_add(1, Ordering::Relaxed);
        debug!(
            resource = %lock.resource_id,
            holder = %lock.holder,
            lock_type = ?lock.lock_type,
            token = lock.fencing_token,
            ?lease,
            "Lease granted"
        );
        Ok(lock)
    }

    /// Like [`acquire`](Self::acquire), but waits up to `wait` for conflicting
    /// leases to be released or to expire.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if the lease is still unavailable after `wait`
    /// - [`LockError::InvalidLease`] for a zero-length lease
    pub async fn acquire_within(
        &self,
        request: LockRequest,
        wait: Duration,
    ) -> Result<ResourceLock, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire(request.clone()) {
                Err(LockError::Conflict { retry_after, .. }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(resource = %request.resource_id, holder = %request.holder, ?wait, "Lock wait timed out");
                        return Err(LockError::Timeout {
                            resource: request.resource_id,
                            waited: wait,
                        });
                    }
                    let wake = (now + retry_after).min(deadline);
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(wake) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Releases `holder`'s live lease on `resource`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] if `holder` has no live lease there,
    /// including when its lease already expired.
    pub fn release(&self, resource: &ResourceId, holder: &str) -> Result<(), LockError> {
        let now = Instant::now();
        let removed = self.table.get_mut(resource).and_then(|mut locks| {
            locks
                .iter()
                .position(|l| l.holder == holder && !l.is_expired(now))
                .map(|i| locks.remove(i))
        });
        let Some(lock) = removed else {
            return Err(LockError::NotHolder {
                resource: resource.clone(),
                holder: holder.to_string(),
            });
        };

        self.table.remove_if(resource, |_, locks| locks.is_empty());
        self.released.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_waiters();
        debug!(resource = %resource, holder, token = lock.fencing_token, "Lease released");
        Ok(())
    }

    /// Extends `holder`'s live lease by its lease length from now.
    /// `acquired_at` is unchanged.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHolder`] if `holder` has no live lease on `resource`
    /// - [`LockError::NotRenewable`] if the lease was granted non-renewable
    pub fn renew(&self, resource: &ResourceId, holder: &str) -> Result<ResourceLock, LockError> {
        let now = Instant::now();
        let not_holder = || LockError::NotHolder {
            resource: resource.clone(),
            holder: holder.to_string(),
        };

        let mut locks = self.table.get_mut(resource).ok_or_else(not_holder)?;
        let lock = locks
            .iter_mut()
            .find(|l| l.holder == holder && !l.is_expired(now))
            .ok_or_else(not_holder)?;
        if !lock.renewable {
            return Err(LockError::NotRenewable {
                resource: resource.clone(),
                holder: holder.to_string(),
            });
        }
        lock.expires_at = now + lock.lease;
        self.renewed.fetch_add(1, Ordering::Relaxed);
        debug!(resource = %resource, holder, "Lease renewed");
        Ok(lock.clone())
    }

    /// Live leases on `resource`.
    #[must_use]
    pub fn holders(&self, resource: &ResourceId) -> Vec<ResourceLock> {
        let now = Instant::now();
        self.table
            .get(resource)
            .map(|locks| locks.iter().filter(|l| !l.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// Resources with at least one entry in the lease table, expired
    /// entries included until they are reaped.
    #[must_use]
    pub fn tracked_resources(&self) -> usize {
        self.table.len()
    }

    /// Drops every expired lease. Returns how many were dropped.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        self.table.retain(|resource, locks| {
            let before = locks.len();
            locks.retain(|l| !l.is_expired(now));
            let dropped = before - locks.len();
            if dropped > 0 {
                warn!(resource = %resource, dropped, "Reaped expired leases");
            }
            reaped += dropped;
            !locks.is_empty()
        });
        if reaped > 0 {
            self.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
            self.changed.notify_waiters();
        }
        reaped
    }

    /// Runs [`reap_expired`](Self::reap_expired) every `interval` until the
    /// handle is dropped or the manager is gone.
    #[must_use = "the reaper stops when the handle is dropped"]
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> ReaperHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.reap_expired();
            }
        });
        ReaperHandle(task)
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            granted: self.granted.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            renewed: self.renewed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

/// Stops the background reaper when dropped.
#[derive(Debug)]
pub struct ReaperHandle(JoinHandle<()>);

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_types::assert_error_codes;
    use proptest::prelude::*;

    const LEASE: Duration = Duration::from_secs(300);

    fn r(name: &str) -> ResourceId {
        ResourceId::new(name)
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_blocks_shared_until_expiry() {
        let locks = LockManager::new(LEASE);
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A acquires");

        let err = locks.acquire(LockRequest::shared("R", "B")).expect_err("conflict");
        assert_eq!(
            err,
            LockError::Conflict {
                resource: r("R"),
                held_by: "A".into(),
                retry_after: LEASE,
            }
        );

        tokio::time::advance(LEASE).await;
        let lease = locks.acquire(LockRequest::shared("R", "B")).expect("A expired");
        assert_eq!(lease.holder, "B");
        assert_eq!(locks.stats().reaped, 1);
    }

    #[test]
    fn shared_leases_coexist() {
        let locks = LockManager::new(LEASE);
        locks.acquire(LockRequest::shared("R", "A")).expect("A");
        locks.acquire(LockRequest::shared("R", "B")).expect("B");
        assert_eq!(locks.holders(&r("R")).len(), 2);
        assert!(locks.acquire(LockRequest::exclusive("R", "C")).is_err());
    }

    #[test]
    fn same_holder_cannot_stack() {
        let locks = LockManager::new(LEASE);
        locks.acquire(LockRequest::shared("R", "A")).expect("first");
        assert!(matches!(
            locks.acquire(LockRequest::shared("R", "A")),
            Err(LockError::Conflict { .. })
        ));
    }

    #[test]
    fn release_requires_holder() {
        let locks = LockManager::new(LEASE);
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A");
        assert_eq!(
            locks.release(&r("R"), "B"),
            Err(LockError::NotHolder {
                resource: r("R"),
                holder: "B".into()
            })
        );
        locks.release(&r("R"), "A").expect("holder releases");
        assert!(locks.release(&r("R"), "A").is_err());
        assert!(locks.holders(&r("R")).is_empty());
        assert_eq!(locks.stats().released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_cannot_be_released_or_renewed() {
        let locks = LockManager::new(LEASE);
        locks
            .acquire(LockRequest::exclusive("R", "A").with_lease(Duration::from_secs(5)))
            .expect("A");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(locks.release(&r("R"), "A"), Err(LockError::NotHolder { .. })));
        assert!(matches!(locks.renew(&r("R"), "A"), Err(LockError::NotHolder { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_without_moving_acquired_at() {
        let locks = LockManager::new(LEASE);
        let first = locks
            .acquire(LockRequest::exclusive("R", "A").with_lease(Duration::from_secs(10)))
            .expect("A");
        tokio::time::advance(Duration::from_secs(8)).await;

        let renewed = locks.renew(&r("R"), "A").expect("renew");
        assert_eq!(renewed.acquired_at, first.acquired_at);
        assert_eq!(renewed.expires_at, first.acquired_at + Duration::from_secs(18));
        assert_eq!(renewed.fencing_token, first.fencing_token);

        assert!(matches!(locks.renew(&r("R"), "B"), Err(LockError::NotHolder { .. })));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(locks.holders(&r("R")).len(), 1);
    }

    #[test]
    fn non_renewable_lease() {
        let locks = LockManager::new(LEASE);
        locks
            .acquire(LockRequest::exclusive("R", "A").non_renewable())
            .expect("A");
        assert!(matches!(locks.renew(&r("R"), "A"), Err(LockError::NotRenewable { .. })));
    }

    #[test]
    fn zero_lease_rejected() {
        let locks = LockManager::new(LEASE);
        let err = locks
            .acquire(LockRequest::exclusive("R", "A").with_lease(Duration::ZERO))
            .expect_err("zero lease");
        assert!(matches!(err, LockError::InvalidLease { .. }));
    }

    #[test]
    fn fencing_tokens_increase() {
        let locks = LockManager::new(LEASE);
        let a = locks.acquire(LockRequest::exclusive("R", "A")).expect("A");
        locks.release(&r("R"), "A").expect("release");
        let b = locks.acquire(LockRequest::exclusive("R", "B")).expect("B");
        let c = locks.acquire(LockRequest::exclusive("S", "C")).expect("C");
        assert!(a.fencing_token < b.fencing_token);
        assert!(b.fencing_token < c.fencing_token);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_wakes_on_release() {
        let locks = Arc::new(LockManager::new(LEASE));
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A");

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire_within(LockRequest::exclusive("R", "B"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        locks.release(&r("R"), "A").expect("release");

        let lease = waiter.await.expect("join").expect("B acquires after release");
        assert_eq!(lease.holder, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_times_out() {
        let locks = LockManager::new(LEASE);
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A");
        let started = Instant::now();
        let err = locks
            .acquire_within(LockRequest::exclusive("R", "B"), Duration::from_secs(2))
            .await
            .expect_err("still held");
        assert_eq!(
            err,
            LockError::Timeout {
                resource: r("R"),
                waited: Duration::from_secs(2)
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_wakes_on_expiry() {
        let locks = LockManager::new(LEASE);
        locks
            .acquire(LockRequest::exclusive("R", "A").with_lease(Duration::from_secs(3)))
            .expect("A");
        let lease = locks
            .acquire_within(LockRequest::exclusive("R", "B"), Duration::from_secs(10))
            .await
            .expect("A's lease lapses");
        assert_eq!(lease.holder, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_drops_expired_leases() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(2)));
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A");
        locks.acquire(LockRequest::exclusive("S", "A")).expect("A");
        let _reaper = locks.spawn_reaper(Duration::from_secs(1));
        assert_eq!(locks.tracked_resources(), 2);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(locks.stats().reaped, 2);
        assert!(locks.holders(&r("R")).is_empty());
        assert_eq!(locks.tracked_resources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_linger_without_reaper() {
        let locks = LockManager::new(Duration::from_secs(1));
        locks.acquire(LockRequest::exclusive("R", "A")).expect("A");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(locks.holders(&r("R")).is_empty());
        assert_eq!(locks.tracked_resources(), 1);
        assert_eq!(locks.reap_expired(), 1);
        assert_eq!(locks.tracked_resources(), 0);
    }

    #[test]
    fn error_codes() {
        let res = r("R");
        assert_error_codes(
            &[
                LockError::Conflict {
                    resource: res.clone(),
                    held_by: "a".into(),
                    retry_after: Duration::ZERO,
                },
                LockError::NotHolder {
                    resource: res.clone(),
                    holder: "a".into(),
                },
                LockError::Timeout {
                    resource: res.clone(),
                    waited: Duration::ZERO,
                },
                LockError::NotRenewable {
                    resource: res.clone(),
                    holder: "a".into(),
                },
                LockError::InvalidLease { resource: res },
            ],
            "LOCK_",
        );
    }

    fn lock_type() -> impl Strategy<Value = LockType> {
        prop_oneof![Just(LockType::Shared), Just(LockType::Exclusive)]
    }

    proptest! {
        #[test]
        fn compatibility_matrix(held in lock_type(), requested in lock_type()) {
            let locks = LockManager::new(LEASE);
            let first = LockRequest { lock_type: held, ..LockRequest::exclusive("R", "A") };
            let second = LockRequest { lock_type: requested, ..LockRequest::exclusive("R", "B") };
            locks.acquire(first).expect("free resource");
            let granted = locks.acquire(second).is_ok();
            prop_assert_eq!(granted, held == LockType::Shared && requested == LockType::Shared);
            prop_assert_eq!(granted, held.compatible_with(requested));
        }
    }
}
