//! OperationCoordinator - runs one operation end-to-end.
//!
//! # Pipeline
//!
//! ```text
//! authenticate ─► authorize ─► consent ─► lock (sorted) ─► operation_started
//!                                                               │
//!       ┌───────────────────────────────────────────────────────┘
//!       ▼
//!  breaker check ─► fresh sandbox ─► task ──ok──► operation_completed
//!                                     │
//!                                    err
//!                                     ├─ circuit open + fallback ─► fallback
//!                                     ├─ transient ─► retry (renew leases, backoff)
//!                                     └─ handle_error ─► operation_failed ─► EnhancedError
//!
//! locks released exactly once on every path, including cancellation
//! ```
//!
//! Every failure, including authentication, comes back as an
//! [`EnhancedError`]. Events are only published once locks are held, so a
//! rejected request produces no lifecycle events.
//!
//! # Breaker Accounting
//!
//! A service breaker is charged once per failed operation, not per retry
//! attempt, and only for failures of the executed task (task errors and
//! timeouts). A failed half-open probe reopens the circuit through its
//! permit.
//!
//! # Locks Across Backoff
//!
//! Retries keep the operation's locks: the retried task mutates the locked
//! resources. Every lease is renewed before each attempt and every third of
//! a lease while an attempt runs. An attempt whose lease cannot be renewed
//! is cancelled. Configuration validation requires the lease to outlast one
//! full attempt plus the longest backoff.
//!
//! # Reaping
//!
//! A coordinator built inside a tokio runtime reaps expired leases every
//! `locks.reap_interval_ms` until it is dropped.

use crate::config::{BastionConfig, ConfigError};
use crate::error::OperationError;
use crate::eventbus::{EventBus, EventTransport};
use crate::lock::{LockError, LockManager, LockRequest, ReaperHandle};
use crate::recovery::{
    classify, CircuitBreakerRegistry, EnhancedError, ErrorContext, InMemoryCheckpointStore,
    RecoveryEngine, RecoveryOutcome, RecoveryStrategy, RetryOperation, RetryPolicy,
};
use crate::sandbox::{
    FilesystemPolicy, InProcessBackend, IsolationBackend, NetworkPolicy, ResourceLimits,
    SandboxError, SandboxManager, SandboxSpec, SandboxTask,
};
use bastion_auth::{
    Actions, AuditRecord, AuditSink, AuthError, AuthenticationGate, AuthenticationResult,
    ConsentApprover, ConsentRequest, ConsentResponse, InMemoryPermissionStore, InboundMessage,
    MemoryAuditLog, PermissionStore, SignatureAlgorithm, SignatureVerifier,
};
use bastion_event::{
    SecurityContext, SystemEvent, OPERATION_COMPLETED, OPERATION_FAILED, OPERATION_STARTED,
};
use bastion_types::{
    CheckpointId, CorrelationId, EventId, OperationId, Principal, ResourceId, RiskLevel, SandboxId,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Event source name on lifecycle events.
pub const COORDINATOR_SOURCE: &str = "coordinator";

/// Audit event for a refused consent request.
pub const CONSENT_DENIED: &str = "consent_denied";

/// Audit event for a request lacking the required permissions.
pub const AUTHORIZATION_FAILED: &str = "authorization_failed";

/// Builds the task for one attempt. Receives the 1-based attempt number.
pub type TaskFactory = Arc<dyn Fn(u32) -> SandboxTask + Send + Sync>;

/// Alternate operation run when the target service's circuit is open.
pub type FallbackOperation =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, OperationError>> + Send>;

/// Sandbox shape for an operation. Capabilities come from the request's
/// required actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxProfile {
    pub limits: ResourceLimits,
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
}

impl SandboxProfile {
    fn spec(&self, id: SandboxId, capabilities: Actions) -> SandboxSpec {
        SandboxSpec::new(id, self.limits)
            .with_network(self.network.clone())
            .with_filesystem(self.filesystem.clone())
            .with_capabilities(capabilities)
    }
}

/// One inbound operation.
///
/// # Example
///
/// ```
/// use bastion_auth::{Actions, InboundMessage};
/// use bastion_runtime::coordinator::OperationRequest;
/// use bastion_runtime::sandbox::SandboxTask;
/// use bastion_types::Principal;
/// use serde_json::json;
///
/// let request = OperationRequest::new(
///     InboundMessage::unsigned(Principal::service("reporter"), "render"),
///     |_attempt| SandboxTask::new("render", |_| async { Ok(json!("done")) }),
/// )
/// .on_resources(["reports/b", "reports/a"])
/// .requires(Actions::READ)
/// .targeting("renderer");
///
/// assert_eq!(request.resources.len(), 2);
/// assert_eq!(request.service.as_deref(), Some("renderer"));
/// ```
pub struct OperationRequest {
    pub id: OperationId,
    pub correlation_id: CorrelationId,
    pub message: InboundMessage,
    /// Resources locked exclusively for the whole operation.
    pub resources: Vec<ResourceId>,
    /// Actions the caller must hold on every resource.
    pub required_actions: Actions,
    /// Downstream service whose breaker guards execution.
    pub service: Option<String>,
    pub profile: SandboxProfile,
    task: TaskFactory,
    retry: Option<RetryPolicy>,
    fallback: Option<FallbackOperation>,
    checkpoint: Option<Value>,
}

impl OperationRequest {
    /// Creates a request with fresh ids, no resources and no required actions.
    pub fn new<F>(message: InboundMessage, task: F) -> Self
    where
        F: Fn(u32) -> SandboxTask + Send + Sync + 'static,
    {
        Self {
            id: OperationId::new(),
            correlation_id: CorrelationId::new(),
            message,
            resources: Vec::new(),
            required_actions: Actions::empty(),
            service: None,
            profile: SandboxProfile::default(),
            task: Arc::new(task),
            retry: None,
            fallback: None,
            checkpoint: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn on_resources<I, R>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceId>,
    {
        self.resources.extend(resources.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn requires(mut self, actions: Actions) -> Self {
        self.required_actions = actions;
        self
    }

    #[must_use]
    pub fn targeting(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: SandboxProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Overrides the coordinator's retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Disables automatic retry.
    #[must_use]
    pub fn no_retry(self) -> Self {
        self.with_retry(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
    }

    /// Sets the operation to run instead when the target circuit is open.
    #[must_use]
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, OperationError>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || fallback().boxed()));
        self
    }

    /// Checkpoints `state` before execution so a failure can offer rollback.
    #[must_use]
    pub fn with_checkpoint(mut self, state: Value) -> Self {
        self.checkpoint = Some(state);
        self
    }
}

impl fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRequest")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("principal", &self.message.principal)
            .field("resources", &self.resources)
            .field("required_actions", &self.required_actions)
            .field("service", &self.service)
            .field("retry", &self.retry)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub operation_id: OperationId,
    pub correlation_id: CorrelationId,
    pub value: Value,
    /// Task executions, including the one that succeeded.
    pub attempts: u32,
    /// `"retry"` or `"fallback"` if recovery produced the value.
    pub recovery: Option<&'static str>,
    pub checkpoint: Option<CheckpointId>,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone)]
struct Settings {
    lease: Duration,
    acquire_timeout: Duration,
    reap_interval: Duration,
    retry: RetryPolicy,
    consent_threshold: RiskLevel,
    consent_timeout: Duration,
}

impl Settings {
    fn from_config(config: &BastionConfig) -> Self {
        Self {
            lease: config.locks.lease(),
            acquire_timeout: config.locks.acquire_timeout(),
            reap_interval: config.locks.reap_interval(),
            retry: config.retry.policy(),
            consent_threshold: config.consent.threshold,
            consent_timeout: config.consent.timeout(),
        }
    }
}

/// Assembles an [`OperationCoordinator`] from configuration and external
/// collaborators.
///
/// Unset collaborators default to an empty permission store, a verifier
/// that rejects every signature, the in-process isolation backend, and a
/// bounded in-memory audit log. Without an approver the consent step is
/// skipped.
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: BastionConfig,
    permissions: Option<Arc<dyn PermissionStore>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    backend: Option<Arc<dyn IsolationBackend>>,
    audit: Option<Arc<dyn AuditSink>>,
    approver: Option<Arc<dyn ConsentApprover>>,
    transport: Option<Arc<dyn EventTransport>>,
}

impl CoordinatorBuilder {
    #[must_use]
    pub fn new(config: BastionConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn permissions(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permissions = Some(store);
        self
    }

    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn approver(mut self, approver: Arc<dyn ConsentApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validates the configuration and wires the components.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration fails validation.
    pub fn build(self) -> Result<OperationCoordinator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(MemoryAuditLog::with_capacity(config.retention.audit_capacity)),
        };
        let permissions: Arc<dyn PermissionStore> = match self.permissions {
            Some(store) => store,
            None => Arc::new(InMemoryPermissionStore::new()),
        };
        let verifier: Arc<dyn SignatureVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(|_: SignatureAlgorithm, _: &[u8], _: &[u8], _: &[u8]| false),
        };
        let backend: Arc<dyn IsolationBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(InProcessBackend::new()),
        };

        let sandboxes = Arc::new(SandboxManager::new(config.sandbox.caps(), backend));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.settings()));
        let checkpoints = Arc::new(InMemoryCheckpointStore::new(
            config.retention.checkpoint_policy(),
        ));
        let recovery = RecoveryEngine::new(breakers, checkpoints, Arc::clone(&audit))
            .with_sandboxes(Arc::clone(&sandboxes));

        let mut events = EventBus::new(config.events.max_redeliveries);
        if let Some(transport) = self.transport {
            events = events.with_transport(transport);
        }

        let settings = Settings::from_config(&config);
        let locks = Arc::new(LockManager::new(settings.lease));
        let reaper = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(locks.spawn_reaper(settings.reap_interval)),
            Err(_) => {
                warn!("No runtime; expired leases are only dropped on acquire");
                None
            }
        };
        debug!(?settings, approver = self.approver.is_some(), reaper = reaper.is_some(), "Coordinator built");

        Ok(OperationCoordinator {
            gate: Arc::new(AuthenticationGate::new(permissions, verifier, Arc::clone(&audit))),
            locks,
            reaper,
            sandboxes,
            recovery: Arc::new(recovery),
            events: Arc::new(events),
            audit,
            approver: self.approver,
            remembered: DashMap::new(),
            settings,
        })
    }
}

/// Orchestrates operations end-to-end. Safe to share across tasks; each
/// [`execute`](Self::execute) call is independent.
///
/// # Example
///
/// ```
/// use bastion_auth::{Actions, InMemoryPermissionStore, InboundMessage, Permission};
/// use bastion_runtime::config::BastionConfig;
/// use bastion_runtime::coordinator::{CoordinatorBuilder, OperationRequest};
/// use bastion_runtime::sandbox::SandboxTask;
/// use bastion_types::Principal;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coordinator = CoordinatorBuilder::new(BastionConfig::default())
///     .build()
///     .expect("default config is valid");
///
/// let request = OperationRequest::new(
///     InboundMessage::unsigned(Principal::service("legacy"), "ping"),
///     |_| SandboxTask::new("ping", |_| async { Ok(json!("pong")) }),
/// )
/// .on_resources(["public"])
/// .requires(Actions::READ);
///
/// let outcome = coordinator.execute(request).await.expect("public read is allowed");
/// assert_eq!(outcome.value, json!("pong"));
/// assert_eq!(outcome.attempts, 1);
/// # }
/// ```
pub struct OperationCoordinator {
    gate: Arc<AuthenticationGate>,
    locks: Arc<LockManager>,
    sandboxes: Arc<SandboxManager>,
    recovery: Arc<RecoveryEngine>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    approver: Option<Arc<dyn ConsentApprover>>,
    remembered: DashMap<Principal, RiskLevel>,
    settings: Settings,
    reaper: Option<ReaperHandle>,
}

impl fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("settings", &self.settings)
            .field("sandboxes", &self.sandboxes)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl OperationCoordinator {
    /// Shorthand for [`CoordinatorBuilder::new`].
    #[must_use]
    pub fn builder(config: BastionConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<AuthenticationGate> {
        &self.gate
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    #[must_use]
    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Returns `true` if expired leases are reaped in the background.
    #[must_use]
    pub fn is_reaping(&self) -> bool {
        self.reaper.is_some()
    }

    /// Runs one operation.
    ///
    /// # Errors
    ///
    /// Returns an [`EnhancedError`] for every failure: authentication,
    /// authorization, consent, lock acquisition, and execution errors that
    /// recovery could not resolve.
    pub async fn execute(
        &self,
        request: OperationRequest,
    ) -> Result<OperationOutcome, EnhancedError> {
        let OperationRequest {
            id,
            correlation_id,
            message,
            resources,
            required_actions,
            service,
            profile,
            task,
            retry,
            fallback,
            checkpoint,
        } = request;
        let resources = lock_order(resources);
        let ctx = ErrorContext::new(correlation_id)
            .with_operation(id)
            .with_resources(resources.clone());
        debug!(operation_id = %id, correlation_id = %correlation_id, ?resources, "Operation received");

        let auth = self
            .gate
            .authenticate(&message)
            .map_err(|e| self.reject(e.into(), &ctx))?;
        self.authorize(&auth, &resources, required_actions)
            .map_err(|e| self.reject(e.into(), &ctx))?;
        self.consent(id, &auth, &resources)
            .await
            .map_err(|e| self.reject(e.into(), &ctx))?;

        let locks = self
            .acquire_locks(id, &resources)
            .await
            .map_err(|e| self.reject(e.into(), &ctx))?;

        let security = SecurityContext {
            principal: auth.principal.clone(),
            authenticated: auth.authenticated,
            risk_level: auth.risk_level,
        };
        let started = self
            .emit(
                OPERATION_STARTED,
                correlation_id,
                &security,
                None,
                json!({
                    "operation_id": id.to_string(),
                    "resources": resources.iter().map(ResourceId::as_str).collect::<Vec<_>>(),
                    "principal": auth.principal.to_string(),
                    "risk_level": auth.risk_level.to_string(),
                }),
            )
            .await;

        let runner = AttemptRunner {
            sandboxes: Arc::clone(&self.sandboxes),
            breakers: Arc::clone(self.recovery.breakers()),
            service: service.clone(),
            profile,
            capabilities: required_actions,
            task,
            renewer: locks.renewer(),
            heartbeat: self.settings.lease / 3,
        };
        let checkpoint = match checkpoint.map(|state| self.recovery.create_checkpoint(id, &state)) {
            Some(Ok(cp)) => Some(cp),
            Some(Err(e)) => {
                return Err(self
                    .fail(e.into(), 0, ctx, None, None, started, &security, locks)
                    .await)
            }
            None => None,
        };
        let policy = retry.unwrap_or(self.settings.retry);

        match self.drive(runner, policy, fallback).await {
            Ok(Ran {
                value,
                attempts,
                recovery,
            }) => {
                self.emit(
                    OPERATION_COMPLETED,
                    correlation_id,
                    &security,
                    started,
                    json!({
                        "operation_id": id.to_string(),
                        "attempts": attempts,
                        "recovery": recovery,
                    }),
                )
                .await;
                locks.release();
                info!(operation_id = %id, attempts, ?recovery, "Operation completed");
                Ok(OperationOutcome {
                    operation_id: id,
                    correlation_id,
                    value,
                    attempts,
                    recovery,
                    checkpoint,
                    risk_level: auth.risk_level,
                })
            }
            Err(Failed { error, attempts }) => Err(self
                .fail(error, attempts, ctx, service, checkpoint, started, &security, locks)
                .await),
        }
    }

    /// Runs the first attempt and any automatic recovery.
    async fn drive(
        &self,
        runner: AttemptRunner,
        policy: RetryPolicy,
        fallback: Option<FallbackOperation>,
    ) -> Result<Ran, Failed> {
        let error = match runner.clone().run(1).await {
            Ok(value) => {
                return Ok(Ran {
                    value,
                    attempts: 1,
                    recovery: None,
                })
            }
            Err(e) => e,
        };

        if let OperationError::CircuitOpen(open) = &error {
            let Some(fallback) = fallback else {
                return Err(Failed { error, attempts: 1 });
            };
            debug!(service = %open.service, "Circuit open, running fallback");
            return match self
                .recovery
                .attempt_recovery(error, RecoveryStrategy::Fallback(fallback()))
                .await
            {
                Ok(outcome) => Ok(Ran {
                    value: outcome_value(outcome),
                    attempts: 1,
                    recovery: Some("fallback"),
                }),
                Err(e) => Err(Failed {
                    error: e.into(),
                    attempts: 1,
                }),
            };
        }

        if !classify(&error).transient || policy.max_attempts <= 1 {
            return Err(Failed { error, attempts: 1 });
        }

        let last_attempt = Arc::new(AtomicU32::new(1));
        let seen = Arc::clone(&last_attempt);
        let operation: RetryOperation = Box::new(move |attempt| {
            seen.store(attempt, Ordering::SeqCst);
            let runner = runner.clone();
            async move {
                runner.renewer.renew_all()?;
                runner.run(attempt).await
            }
            .boxed()
        });
        let strategy = RecoveryStrategy::Retry {
            policy,
            attempts_made: 1,
            operation,
        };
        match self.recovery.attempt_recovery(error, strategy).await {
            Ok(outcome) => Ok(Ran {
                value: outcome_value(outcome),
                attempts: last_attempt.load(Ordering::SeqCst),
                recovery: Some("retry"),
            }),
            Err(e) => Err(Failed {
                error: e.into(),
                attempts: last_attempt.load(Ordering::SeqCst),
            }),
        }
    }

    /// Enriches a post-lock failure, publishes `operation_failed`, then
    /// releases the locks.
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        error: OperationError,
        attempts: u32,
        ctx: ErrorContext,
        service: Option<String>,
        checkpoint: Option<CheckpointId>,
        started: Option<EventId>,
        security: &SecurityContext,
        locks: LockSet,
    ) -> EnhancedError {
        let mut ctx = ctx.with_attempt(attempts);
        if let Some(service) = service.filter(|_| charges_service(&error)) {
            ctx = ctx.with_service(service);
        }
        if let Some(checkpoint) = checkpoint {
            ctx = ctx.with_checkpoint(checkpoint);
        }
        let correlation_id = ctx.correlation_id;
        let enhanced = self.recovery.handle_error(&error, ctx);

        self.emit(
            OPERATION_FAILED,
            correlation_id,
            security,
            started,
            json!({
                "operation_id": enhanced.context.operation_id.map(|op| op.to_string()),
                "error_id": enhanced.id.to_string(),
                "code": enhanced.code,
                "category": enhanced.classification.category.as_str(),
            }),
        )
        .await;
        locks.release();
        warn!(error_id = %enhanced.id, code = enhanced.code, attempts, "Operation failed");
        enhanced
    }

    /// Enriches a failure raised before any lock was taken.
    fn reject(&self, error: OperationError, ctx: &ErrorContext) -> EnhancedError {
        let enhanced = self.recovery.handle_error(&error, ctx.clone());
        debug!(error_id = %enhanced.id, code = enhanced.code, "Operation rejected");
        enhanced
    }

    fn authorize(
        &self,
        auth: &AuthenticationResult,
        resources: &[ResourceId],
        required: Actions,
    ) -> Result<(), AuthError> {
        if required.is_empty() {
            return Ok(());
        }
        let Some(resource) = resources.iter().find(|r| !auth.permits(r.as_str(), required)) else {
            return Ok(());
        };
        warn!(principal = %auth.principal, resource = %resource, %required, "Authorization failed");
        self.audit.append(AuditRecord::now(
            AUTHORIZATION_FAILED,
            json!({
                "principal": auth.principal.to_string(),
                "resource": resource.as_str(),
                "required": required.names(),
            }),
        ));
        Err(AuthError::Unauthorized {
            principal: auth.principal.clone(),
            resource: resource.as_str().to_string(),
            required,
        })
    }

    async fn consent(
        &self,
        operation_id: OperationId,
        auth: &AuthenticationResult,
        resources: &[ResourceId],
    ) -> Result<(), AuthError> {
        let risk = auth.risk_level;
        if risk < self.settings.consent_threshold {
            return Ok(());
        }
        let Some(approver) = &self.approver else {
            debug!(%risk, "No approver configured, consent skipped");
            return Ok(());
        };
        let remembered = self.remembered.get(&auth.principal).map(|level| *level.value());
        if remembered.is_some_and(|level| level >= risk) {
            debug!(principal = %auth.principal, %risk, "Using remembered consent");
            return Ok(());
        }

        let request = ConsentRequest {
            operation_id,
            principal: auth.principal.clone(),
            risk_level: risk,
            resources: resources.iter().map(|r| r.as_str().to_string()).collect(),
            description: format!("{risk}-risk operation on {} resource(s)", resources.len()),
        };
        let timeout = self.settings.consent_timeout;
        let response = tokio::time::timeout(timeout, approver.request_consent(request))
            .await
            .unwrap_or_else(|_| ConsentResponse::deny(format!("no decision within {timeout:?}")));

        if response.approved {
            if response.remember {
                self.remembered
                    .entry(auth.principal.clone())
                    .and_modify(|level| *level = (*level).max(risk))
                    .or_insert(risk);
            }
            debug!(principal = %auth.principal, %risk, "Consent granted");
            return Ok(());
        }

        let reason = response.reason.unwrap_or_else(|| "denied".to_string());
        warn!(principal = %auth.principal, %risk, %reason, "Consent denied");
        self.audit.append(AuditRecord::now(
            CONSENT_DENIED,
            json!({
                "operation_id": operation_id.to_string(),
                "principal": auth.principal.to_string(),
                "risk_level": risk.to_string(),
                "reason": reason,
            }),
        ));
        Err(AuthError::ConsentDenied {
            principal: auth.principal.clone(),
            reason,
        })
    }

    async fn acquire_locks(
        &self,
        operation_id: OperationId,
        resources: &[ResourceId],
    ) -> Result<LockSet, LockError> {
        let mut set = LockSet {
            manager: Arc::clone(&self.locks),
            holder: operation_id.to_string(),
            held: Vec::with_capacity(resources.len()),
        };
        for resource in resources {
            let request = LockRequest::exclusive(resource.clone(), set.holder.clone())
                .with_lease(self.settings.lease);
            self.locks
                .acquire_within(request, self.settings.acquire_timeout)
                .await?;
            set.held.push(resource.clone());
        }
        Ok(set)
    }

    async fn emit(
        &self,
        event_type: &str,
        correlation_id: CorrelationId,
        security: &SecurityContext,
        cause: Option<EventId>,
        data: Value,
    ) -> Option<EventId> {
        let mut builder = SystemEvent::builder(event_type, COORDINATOR_SOURCE, correlation_id)
            .security(security.clone())
            .data(data);
        if let Some(cause) = cause {
            builder = builder.caused_by(cause);
        }
        match builder.build() {
            Ok(event) => {
                let id = event.id;
                self.events.publish(event).await;
                Some(id)
            }
            Err(e) => {
                warn!(event_type, error = %e, "Lifecycle event not published");
                None
            }
        }
    }
}

/// Sorted and deduplicated, so concurrent operations lock in the same order.
fn lock_order(mut resources: Vec<ResourceId>) -> Vec<ResourceId> {
    resources.sort();
    resources.dedup();
    resources
}

/// Task failures charge the target service; everything else happened
/// before the service was reached.
fn charges_service(error: &OperationError) -> bool {
    match error {
        OperationError::Sandbox(SandboxError::TaskFailed { .. } | SandboxError::Timeout { .. }) => {
            true
        }
        OperationError::Recovery(e) => e.last_error().is_some_and(charges_service),
        _ => false,
    }
}

fn outcome_value(outcome: RecoveryOutcome) -> Value {
    match outcome {
        RecoveryOutcome::Recovered(value) | RecoveryOutcome::RolledBack(value) => value,
        RecoveryOutcome::NotAttempted => Value::Null,
    }
}

struct Ran {
    value: Value,
    attempts: u32,
    recovery: Option<&'static str>,
}

struct Failed {
    error: OperationError,
    attempts: u32,
}

/// Everything one attempt needs, cloneable into retry closures.
#[derive(Clone)]
struct AttemptRunner {
    sandboxes: Arc<SandboxManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    service: Option<String>,
    profile: SandboxProfile,
    capabilities: Actions,
    task: TaskFactory,
    renewer: LeaseRenewer,
    heartbeat: Duration,
}

impl AttemptRunner {
    async fn run(self, attempt: u32) -> Result<Value, OperationError> {
        let permit = match &self.service {
            Some(service) => Some(self.breakers.check(service)?),
            None => None,
        };

        let spec = self.profile.spec(SandboxId::generate(), self.capabilities);
        let sandbox = SandboxGuard::create(&self.sandboxes, spec).await?;
        debug!(sandbox = %sandbox.id, attempt, "Executing attempt");
        let task = (self.task)(attempt);
        let result = tokio::select! {
            result = self.sandboxes.execute(&sandbox.id, task) => result.map_err(OperationError::from),
            lost = self.renewer.keep_alive(self.heartbeat) => {
                warn!(sandbox = %sandbox.id, attempt, error = %lost, "Lease lost, cancelling attempt");
                Err(lost.into())
            }
        };
        sandbox.teardown().await;

        let value = result?;
        if let Some(permit) = permit {
            permit.success();
        }
        Ok(value)
    }
}

/// Exclusive leases held by one operation.
///
/// Released in reverse order exactly once: by [`release`](Self::release)
/// or, if the operation future is dropped first, on drop.
struct LockSet {
    manager: Arc<LockManager>,
    holder: String,
    held: Vec<ResourceId>,
}

impl LockSet {
    fn renewer(&self) -> LeaseRenewer {
        LeaseRenewer {
            manager: Arc::clone(&self.manager),
            holder: self.holder.clone(),
            resources: self.held.clone(),
        }
    }

    fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for resource in self.held.drain(..).rev() {
            if let Err(e) = self.manager.release(&resource, &self.holder) {
                warn!(resource = %resource, holder = %self.holder, error = %e, "Lease lost before release");
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            debug!(holder = %self.holder, count = self.held.len(), "Releasing leases on drop");
            self.release_all();
        }
    }
}

#[derive(Clone)]
struct LeaseRenewer {
    manager: Arc<LockManager>,
    holder: String,
    resources: Vec<ResourceId>,
}

impl LeaseRenewer {
    fn renew_all(&self) -> Result<(), LockError> {
        for resource in &self.resources {
            self.manager.renew(resource, &self.holder)?;
        }
        Ok(())
    }

    /// Renews every lease now and then every `every`. Resolves only once a
    /// lease can no longer be renewed.
    async fn keep_alive(&self, every: Duration) -> LockError {
        if self.resources.is_empty() {
            return std::future::pending().await;
        }
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.renew_all() {
                return e;
            }
        }
    }
}

/// Destroys its sandbox on every path. A guard dropped without
/// [`teardown`](Self::teardown) schedules destruction on the runtime.
struct SandboxGuard {
    manager: Arc<SandboxManager>,
    id: SandboxId,
    armed: bool,
}

impl SandboxGuard {
    async fn create(manager: &Arc<SandboxManager>, spec: SandboxSpec) -> Result<Self, SandboxError> {
        let id = manager.create(spec).await?;
        Ok(Self {
            manager: Arc::clone(manager),
            id,
            armed: true,
        })
    }

    async fn teardown(mut self) {
        self.armed = false;
        self.manager.destroy(&self.id).await;
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sandbox = %self.id, "No runtime to tear down sandbox");
            return;
        };
        let manager = Arc::clone(&self.manager);
        let id = self.id.clone();
        runtime.spawn(async move { manager.destroy(&id).await });
    }
}
