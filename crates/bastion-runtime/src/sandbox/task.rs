//! Work executed inside a sandbox.

use super::{FilesystemPolicy, NetworkPolicy, ResourceDemand, ResourceLimits, SandboxError};
use crate::recovery::classify_message;
use bastion_auth::Actions;
use bastion_types::SandboxId;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed future a task runs as.
pub type TaskFuture = BoxFuture<'static, Result<Value, TaskError>>;

/// Failure reported by a task.
///
/// Tasks may state whether the failure is transient. Without a hint the
/// message is classified heuristically (`"connection reset"` is transient,
/// `"invalid input"` is not).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskError {
    message: String,
    transient: Option<bool>,
}

impl TaskError {
    /// Failure without a transience hint.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: None,
        }
    }

    /// Failure that may succeed on retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: Some(true),
        }
    }

    /// Failure that will not succeed on retry.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: Some(false),
        }
    }

    /// The task's message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The explicit hint, if the task gave one.
    #[must_use]
    pub fn transient_hint(&self) -> Option<bool> {
        self.transient
    }

    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.transient
            .unwrap_or_else(|| classify_message(&self.message).1)
    }
}

/// What a running task can see of its sandbox.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    /// Sandbox the task runs in.
    pub sandbox_id: SandboxId,
    /// Enforced limits.
    pub limits: ResourceLimits,
    /// Capabilities the sandbox grants.
    pub capabilities: Actions,
    network: NetworkPolicy,
    filesystem: FilesystemPolicy,
}

impl SandboxContext {
    pub(crate) fn new(
        sandbox_id: SandboxId,
        limits: ResourceLimits,
        capabilities: Actions,
        network: NetworkPolicy,
        filesystem: FilesystemPolicy,
    ) -> Self {
        Self {
            sandbox_id,
            limits,
            capabilities,
            network,
            filesystem,
        }
    }

    /// Returns `true` if the network policy allows `host`.
    #[must_use]
    pub fn can_connect(&self, host: &str) -> bool {
        self.network.permits(host)
    }

    /// Validates a read against the filesystem policy.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PathDenied`] if the path escapes the allowed roots.
    pub fn validate_read(&self, path: &str) -> Result<PathBuf, SandboxError> {
        self.filesystem.validate_read(path)
    }

    /// Validates a write against the filesystem policy.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PathDenied`] if the policy is read-only or the
    /// path escapes the allowed roots.
    pub fn validate_write(&self, path: &str) -> Result<PathBuf, SandboxError> {
        self.filesystem.validate_write(path)
    }
}

/// One unit of work for [`SandboxManager::execute`](super::SandboxManager::execute).
///
/// # Example
///
/// ```
/// use bastion_auth::Actions;
/// use bastion_runtime::sandbox::{ResourceDemand, SandboxTask};
/// use serde_json::json;
///
/// let task = SandboxTask::new("resize", |ctx| async move {
///     Ok(json!({ "ran_in": ctx.sandbox_id.as_str() }))
/// })
/// .with_demand(ResourceDemand { memory_mb: 128, ..ResourceDemand::default() })
/// .requires(Actions::READ);
///
/// assert_eq!(task.name(), "resize");
/// ```
pub struct SandboxTask {
    name: String,
    demand: ResourceDemand,
    required: Actions,
    run: Box<dyn FnOnce(SandboxContext) -> TaskFuture + Send>,
}

impl SandboxTask {
    /// Creates a task from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(SandboxContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            demand: ResourceDemand::default(),
            required: Actions::empty(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    /// Declares the resource envelope the task needs.
    #[must_use]
    pub fn with_demand(mut self, demand: ResourceDemand) -> Self {
        self.demand = demand;
        self
    }

    /// Declares capabilities the task needs.
    #[must_use]
    pub fn requires(mut self, actions: Actions) -> Self {
        self.required = actions;
        self
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared demand.
    #[must_use]
    pub fn demand(&self) -> &ResourceDemand {
        &self.demand
    }

    /// Required capabilities.
    #[must_use]
    pub fn required(&self) -> Actions {
        self.required
    }

    pub(crate) fn start(self, ctx: SandboxContext) -> (String, TaskFuture) {
        (self.name, (self.run)(ctx))
    }
}

impl std::fmt::Debug for SandboxTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxTask")
            .field("name", &self.name)
            .field("demand", &self.demand)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}
