//! Immutable state checkpoints.
//!
//! A [`Checkpoint`] holds a serialized copy of the caller's state. The copy
//! shares nothing with the original, so later mutation of the live state
//! cannot reach it. Stores are append-only: checkpoints are inserted and
//! evicted, never modified.

use bastion_types::{CheckpointId, ErrorCode, OperationId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Checkpoint errors.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | `NotFound` | `CHECKPOINT_NOT_FOUND` | No |
/// | `MissingDependency` | `CHECKPOINT_MISSING_DEPENDENCY` | No |
/// | `Snapshot` | `CHECKPOINT_SNAPSHOT` | No |
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    /// No checkpoint with this id (never written, or evicted).
    #[error("checkpoint not found: {0}")]
    NotFound(CheckpointId),

    /// A checkpoint depends on one that is absent.
    #[error("checkpoint {checkpoint} depends on missing {dependency}")]
    MissingDependency {
        checkpoint: CheckpointId,
        dependency: CheckpointId,
    },

    /// The state could not be serialized.
    #[error("state snapshot failed: {0}")]
    Snapshot(String),
}

impl ErrorCode for CheckpointError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "CHECKPOINT_NOT_FOUND",
            Self::MissingDependency { .. } => "CHECKPOINT_MISSING_DEPENDENCY",
            Self::Snapshot(_) => "CHECKPOINT_SNAPSHOT",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Point-in-time snapshot of operation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    pub operation_id: OperationId,
    /// Owned copy of the state.
    pub state: Value,
    /// Checkpoints this one builds on.
    pub dependencies: Vec<CheckpointId>,
}

impl Checkpoint {
    /// Serializes `state` into a new checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Snapshot`] if `state` cannot be serialized.
    pub fn capture<T: Serialize + ?Sized>(
        operation_id: OperationId,
        state: &T,
        dependencies: Vec<CheckpointId>,
    ) -> Result<Self, CheckpointError> {
        let state =
            serde_json::to_value(state).map_err(|e| CheckpointError::Snapshot(e.to_string()))?;
        Ok(Self {
            id: CheckpointId::new(),
            timestamp: Utc::now(),
            operation_id,
            state,
            dependencies,
        })
    }
}

/// Append-only checkpoint storage.
pub trait CheckpointStore: Send + Sync {
    /// Stores a checkpoint and applies retention.
    ///
    /// # Errors
    ///
    /// Backend-specific; the in-memory store never fails.
    fn insert(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// Looks up a checkpoint.
    fn get(&self, id: &CheckpointId) -> Option<Arc<Checkpoint>>;

    /// Returns `true` if the checkpoint is stored.
    fn contains(&self, id: &CheckpointId) -> bool {
        self.get(id).is_some()
    }

    /// Stored checkpoints.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies retention now. Returns the number of evicted checkpoints.
    fn prune(&self) -> usize;
}

/// Fetches `id` and verifies that its whole dependency chain is present.
///
/// # Errors
///
/// - [`CheckpointError::NotFound`] if `id` is absent
/// - [`CheckpointError::MissingDependency`] if any ancestor is absent
pub fn resolve_chain(
    store: &dyn CheckpointStore,
    id: &CheckpointId,
) -> Result<Arc<Checkpoint>, CheckpointError> {
    let root = store.get(id).ok_or(CheckpointError::NotFound(*id))?;

    let mut seen = HashSet::from([*id]);
    let mut pending: VecDeque<Arc<Checkpoint>> = VecDeque::from([Arc::clone(&root)]);
    while let Some(current) = pending.pop_front() {
        for dep in &current.dependencies {
            if !seen.insert(*dep) {
                continue;
            }
            let parent = store.get(dep).ok_or(CheckpointError::MissingDependency {
                checkpoint: current.id,
                dependency: *dep,
            })?;
            pending.push_back(parent);
        }
    }
    Ok(root)
}

/// Retention bounds for [`InMemoryCheckpointStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Oldest checkpoints are evicted beyond this count.
    pub max_count: usize,
    /// Checkpoints older than this are evicted.
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 1_024,
            max_age: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<CheckpointId, Arc<Checkpoint>>,
    order: VecDeque<(CheckpointId, Instant)>,
}

/// Bounded in-memory checkpoint store.
///
/// Evicts oldest-first on every insert and on [`prune`](CheckpointStore::prune).
///
/// # Example
///
/// ```
/// use bastion_runtime::recovery::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, RetentionPolicy};
/// use bastion_types::OperationId;
/// use std::time::Duration;
///
/// let store = InMemoryCheckpointStore::new(RetentionPolicy { max_count: 2, max_age: Duration::from_secs(60) });
/// let op = OperationId::new();
/// let ids: Vec<_> = (0..3)
///     .map(|n| {
///         let cp = Checkpoint::capture(op, &n, vec![]).expect("serializable");
///         let id = cp.id;
///         store.insert(cp).expect("in-memory insert");
///         id
///     })
///     .collect();
/// assert_eq!(store.len(), 2);
/// assert!(!store.contains(&ids[0]));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    policy: RetentionPolicy,
    inner: RwLock<StoreInner>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store with `policy`.
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Retention bounds.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    fn evict(&self, inner: &mut StoreInner, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(&(id, written)) = inner.order.front() {
            let over_count = inner.order.len() > self.policy.max_count;
            let too_old = now.saturating_duration_since(written) > self.policy.max_age;
            if !over_count && !too_old {
                break;
            }
            inner.order.pop_front();
            inner.entries.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = inner.order.len(), "Checkpoints pruned");
        }
        evicted
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn insert(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let now = Instant::now();
        let id = checkpoint.id;
        let mut inner = self.inner.write();
        if inner.entries.insert(id, Arc::new(checkpoint)).is_none() {
            inner.order.push_back((id, now));
        }
        self.evict(&mut inner, now);
        debug!(checkpoint = %id, "Checkpoint written");
        Ok(())
    }

    fn get(&self, id: &CheckpointId) -> Option<Arc<Checkpoint>> {
        self.inner.read().entries.get(id).cloned()
    }

    fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    fn prune(&self) -> usize {
        let mut inner = self.inner.write();
        self.evict(&mut inner, Instant::now())
    }
}
