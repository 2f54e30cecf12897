//! Isolation backends.
//!
//! The [`SandboxManager`](super::SandboxManager) owns lifecycle and policy;
//! a backend only knows how to prepare an environment, run a future in it,
//! and tear it down. Process, container or VM isolation plug in here.

use super::{SandboxError, SandboxSpec, TaskError, TaskFuture};
use async_trait::async_trait;
use bastion_types::SandboxId;
use dashmap::DashSet;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;

/// Opaque handle to a prepared environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    sandbox: SandboxId,
    token: u64,
}

impl BackendHandle {
    /// Creates a handle. Backends choose the token.
    #[must_use]
    pub fn new(sandbox: SandboxId, token: u64) -> Self {
        Self { sandbox, token }
    }

    /// Sandbox this handle belongs to.
    #[must_use]
    pub fn sandbox(&self) -> &SandboxId {
        &self.sandbox
    }

    /// Backend-specific token.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Pluggable isolation mechanism.
///
/// `execute` must stop the task when its returned future is dropped: the
/// manager enforces the wall-clock limit by dropping it.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Prepares an environment for `spec`.
    async fn initialize(&self, spec: &SandboxSpec) -> Result<BackendHandle, SandboxError>;

    /// Runs `task` inside the environment.
    async fn execute(&self, handle: &BackendHandle, task: TaskFuture) -> Result<Value, TaskError>;

    /// Releases the environment.
    async fn teardown(&self, handle: BackendHandle) -> Result<(), SandboxError>;
}

/// Runs tasks on the tokio runtime of the calling process.
///
/// Offers timeout and cancellation but no memory or syscall isolation.
/// Suitable for trusted tasks and tests.
#[derive(Debug, Default)]
pub struct InProcessBackend {
    next_token: AtomicU64,
    environments: DashSet<u64>,
}

impl InProcessBackend {
    /// Creates a backend with no live environments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Environments initialized and not yet torn down.
    #[must_use]
    pub fn live(&self) -> usize {
        self.environments.len()
    }
}

/// Aborts the spawned task if the owning future is dropped.
struct AbortOnDrop(JoinHandle<Result<Value, TaskError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl IsolationBackend for InProcessBackend {
    async fn initialize(&self, spec: &SandboxSpec) -> Result<BackendHandle, SandboxError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.environments.insert(token);
        debug!(sandbox = %spec.id, token, "In-process environment ready");
        Ok(BackendHandle::new(spec.id.clone(), token))
    }

    async fn execute(&self, handle: &BackendHandle, task: TaskFuture) -> Result<Value, TaskError> {
        let mut guard = AbortOnDrop(tokio::spawn(task));
        match (&mut guard.0).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                debug!(sandbox = %handle.sandbox, "Task panicked: {msg}");
                Err(TaskError::permanent(format!("task panicked: {msg}")))
            }
            Err(_) => Err(TaskError::permanent("task cancelled")),
        }
    }

    async fn teardown(&self, handle: BackendHandle) -> Result<(), SandboxError> {
        if self.environments.remove(&handle.token).is_some() {
            debug!(sandbox = %handle.sandbox, token = handle.token, "In-process environment released");
        } else {
            debug!(sandbox = %handle.sandbox, token = handle.token, "Teardown of unknown environment ignored");
        }
        Ok(())
    }
}
