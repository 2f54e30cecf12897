//! Sandbox registry and lifecycle.

use super::{
    BackendHandle, IsolationBackend, SandboxCaps, SandboxContext, SandboxError, SandboxSpec,
    SandboxTask,
};
use bastion_types::SandboxId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Ready,
    Running,
}

#[derive(Debug)]
struct SlotState {
    phase: Phase,
    handle: Option<BackendHandle>,
    destroyed: bool,
}

#[derive(Debug)]
struct Slot {
    spec: SandboxSpec,
    state: Mutex<SlotState>,
}

/// Returns a surviving sandbox to `Ready` when its execution ends, including
/// when the caller drops the execute future.
struct RunningPhase<'a>(&'a Slot);

impl Drop for RunningPhase<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if !state.destroyed && state.phase == Phase::Running {
            state.phase = Phase::Ready;
        }
    }
}

/// Creates, runs and tears down sandboxes.
///
/// The registry is sharded by id, so unrelated sandboxes never contend.
/// Per-sandbox state sits behind a mutex that is never held across `.await`.
///
/// # Lifecycle
///
/// ```text
/// create ──► Initializing ──► Ready ◄──► Running ──► (single_use) destroyed
///                               │           │
///                               └───────────┴──► destroy / timeout ──► destroyed
/// ```
///
/// # Example
///
/// ```
/// use bastion_runtime::sandbox::{
///     InProcessBackend, ResourceLimits, SandboxManager, SandboxSpec, SandboxTask,
/// };
/// use bastion_runtime::config::SandboxCapsConfig;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # block_on(async {
/// let manager = SandboxManager::new(SandboxCapsConfig::default().caps(), Arc::new(InProcessBackend::new()));
/// let id = manager
///     .create(SandboxSpec::new("sbx-doc", ResourceLimits::default()))
///     .await
///     .expect("within caps");
/// let out = manager
///     .execute(&id, SandboxTask::new("hello", |_| async { Ok(json!("hi")) }))
///     .await
///     .expect("task succeeds");
/// assert_eq!(out, json!("hi"));
/// assert!(!manager.contains(&id));
/// # });
/// # fn block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime").block_on(f)
/// # }
/// ```
pub struct SandboxManager {
    caps: SandboxCaps,
    backend: Arc<dyn IsolationBackend>,
    registry: DashMap<SandboxId, Arc<Slot>>,
    live: AtomicUsize,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("caps", &self.caps)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Creates a manager enforcing `caps` on top of `backend`.
    #[must_use]
    pub fn new(caps: SandboxCaps, backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            caps,
            backend,
            registry: DashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// System-wide caps.
    #[must_use]
    pub fn caps(&self) -> &SandboxCaps {
        &self.caps
    }

    /// Validates `spec`, initializes an environment and registers it.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::InvalidConfig`] if limits exceed the caps
    /// - [`SandboxError::CapacityExhausted`] if `max_sandboxes` are live
    /// - [`SandboxError::Conflict`] if the id is already registered
    /// - [`SandboxError::NotFound`] if the sandbox was destroyed while initializing
    /// - any error from the backend's `initialize`
    pub async fn create(&self, spec: SandboxSpec) -> Result<SandboxId, SandboxError> {
        self.caps.check(&spec.limits)?;

        let max = self.caps.max_sandboxes;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|_| SandboxError::CapacityExhausted { max })?;

        let id = spec.id.clone();
        let slot = Arc::new(Slot {
            spec,
            state: Mutex::new(SlotState {
                phase: Phase::Initializing,
                handle: None,
                destroyed: false,
            }),
        });

        match self.registry.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(SandboxError::Conflict(id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        let handle = match self.backend.initialize(&slot.spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.unregister(&id, &slot);
                warn!(sandbox = %id, error = %e, "Sandbox initialization failed");
                return Err(e);
            }
        };

        let orphaned = {
            let mut state = slot.state.lock();
            if state.destroyed {
                Some(handle)
            } else {
                state.handle = Some(handle);
                state.phase = Phase::Ready;
                None
            }
        };
        if let Some(handle) = orphaned {
            self.teardown(&id, handle).await;
            return Err(SandboxError::NotFound(id));
        }

        debug!(sandbox = %id, limits = ?slot.spec.limits, "Sandbox created");
        Ok(id)
    }

    /// Runs `task` in the sandbox under its wall-clock limit.
    ///
    /// On timeout the task is cancelled and the sandbox destroyed. A
    /// single-use sandbox is destroyed after any completed execution.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::NotFound`] if the id is unknown
    /// - [`SandboxError::CapabilityDenied`] / [`SandboxError::LimitExceeded`]
    ///   if the task asks for more than the sandbox grants
    /// - [`SandboxError::Busy`] if another task is running
    /// - [`SandboxError::Timeout`] if `max_duration_sec` elapses
    /// - [`SandboxError::TaskFailed`] if the task returns an error
    pub async fn execute(&self, id: &SandboxId, task: SandboxTask) -> Result<Value, SandboxError> {
        let slot = self
            .registry
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SandboxError::NotFound(id.clone()))?;
        let spec = &slot.spec;

        if !spec.capabilities.contains(task.required()) {
            return Err(SandboxError::CapabilityDenied {
                sandbox: id.clone(),
                required: task.required(),
                granted: spec.capabilities,
            });
        }
        if let Some((resource, demand, limit)) = task.demand().exceeds(&spec.limits) {
            return Err(SandboxError::LimitExceeded {
                sandbox: id.clone(),
                resource,
                demand,
                limit,
            });
        }

        let handle = {
            let mut state = slot.state.lock();
            if state.destroyed {
                return Err(SandboxError::NotFound(id.clone()));
            }
            match (state.phase, state.handle.clone()) {
                (Phase::Ready, Some(handle)) => {
                    state.phase = Phase::Running;
                    handle
                }
                _ => return Err(SandboxError::Busy(id.clone())),
            }
        };
        let _running = RunningPhase(&slot);

        let ctx = SandboxContext::new(
            id.clone(),
            spec.limits,
            spec.capabilities,
            spec.network.clone(),
            spec.filesystem.clone(),
        );
        let (task_name, future) = task.start(ctx);
        let limit = spec.limits.max_duration();
        debug!(sandbox = %id, task = %task_name, "Executing task");

        let outcome = tokio::time::timeout(limit, self.backend.execute(&handle, future)).await;

        let Ok(result) = outcome else {
            warn!(sandbox = %id, task = %task_name, ?limit, "Task timed out; destroying sandbox");
            self.destroy(id).await;
            return Err(SandboxError::Timeout {
                sandbox: id.clone(),
                limit,
            });
        };

        if spec.single_use {
            self.destroy(id).await;
        }

        result.map_err(|source| SandboxError::TaskFailed {
            sandbox: id.clone(),
            task: task_name,
            source,
        })
    }

    /// Tears the sandbox down. Unknown or already destroyed ids are a no-op.
    pub async fn destroy(&self, id: &SandboxId) {
        let Some((_, slot)) = self.registry.remove(id) else {
            debug!(sandbox = %id, "Destroy of unknown sandbox ignored");
            return;
        };
        self.live.fetch_sub(1, Ordering::SeqCst);

        let handle = {
            let mut state = slot.state.lock();
            state.destroyed = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            self.teardown(id, handle).await;
        }
        debug!(sandbox = %id, "Sandbox destroyed");
    }

    /// Returns `true` if the id is registered.
    #[must_use]
    pub fn contains(&self, id: &SandboxId) -> bool {
        self.registry.contains_key(id)
    }

    /// Registered sandboxes, including ones still initializing.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// The spec a sandbox was created with.
    #[must_use]
    pub fn spec(&self, id: &SandboxId) -> Option<SandboxSpec> {
        self.registry.get(id).map(|entry| entry.value().spec.clone())
    }

    fn unregister(&self, id: &SandboxId, slot: &Arc<Slot>) {
        if self
            .registry
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn teardown(&self, id: &SandboxId, handle: BackendHandle) {
        if let Err(e) = self.backend.teardown(handle).await {
            warn!(sandbox = %id, error = %e, "Backend teardown failed");
        }
    }
}
