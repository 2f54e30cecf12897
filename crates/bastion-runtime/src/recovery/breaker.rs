//! Per-service circuit breakers.
//!
//! # State Machine
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ───────────────────────────────► Open
//!     ▲                                      │ recovery_timeout elapsed
//!     │ successes >= success_threshold       ▼
//!     └──────────────────────────────── HalfOpen ──► Open (probe failed)
//! ```
//!
//! Half-open admits exactly one in-flight probe. A probe [`CallPermit`]
//! dropped without an outcome counts as a failed probe.
//!
//! Each breaker sits behind its own mutex inside a sharded map, so
//! transitions are linearizable per service and services never contend.

use bastion_types::ErrorCode;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub recovery_timeout: Duration,
    /// Successful probes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe is allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call was rejected because the circuit is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for '{service}', retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Service whose circuit is open.
    pub service: String,
    /// Time until a probe may be admitted. Zero while a probe is in flight.
    pub retry_after: Duration,
}

impl ErrorCode for CircuitOpenError {
    fn code(&self) -> &'static str {
        "CIRCUIT_OPEN"
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Service name.
    pub service: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub failures: u32,
    /// Remaining open time, if open.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Breaker {
    settings: BreakerSettings,
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    generation: u64,
}

impl Breaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            probe_in_flight: false,
            generation: 0,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|at| (at + self.settings.recovery_timeout).saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn refresh(&mut self, service: &str, now: Instant) {
        if self.state == CircuitState::Open && self.remaining(now).is_zero() {
            self.state = CircuitState::HalfOpen;
            self.successes = 0;
            self.probe_in_flight = false;
            debug!(service, "Circuit half-open");
        }
    }

    /// Returns `Ok(is_probe)` or the retry-after duration.
    fn admit(&mut self, service: &str, now: Instant) -> Result<bool, Duration> {
        self.refresh(service, now);
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(self.remaining(now)),
            CircuitState::HalfOpen if self.probe_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    fn open(&mut self, service: &str, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
        self.probe_in_flight = false;
        self.generation += 1;
        warn!(
            service,
            failures = self.failures,
            recovery_timeout = ?self.settings.recovery_timeout,
            "Circuit opened"
        );
    }

    fn on_success(&mut self, service: &str) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.successes += 1;
                if self.successes >= self.settings.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.successes = 0;
                    self.opened_at = None;
                    info!(service, "Circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, service: &str, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failures = (self.failures + 1).min(self.settings.failure_threshold);
                if self.failures >= self.settings.failure_threshold {
                    self.open(service, now);
                }
            }
            CircuitState::HalfOpen => self.open(service, now),
            // Already failing fast; late reports must not extend the timeout.
            CircuitState::Open => {}
        }
    }
}

/// Permission to make one call through a breaker.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unresolved probe permit reopens
/// the circuit; dropping any other permit records nothing.
#[derive(Debug)]
#[must_use = "report the call outcome through the permit"]
pub struct CallPermit {
    service: String,
    breaker: Arc<Mutex<Breaker>>,
    generation: u64,
    probe: bool,
    resolved: bool,
}

impl CallPermit {
    /// Returns `true` if this call is the half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Service this permit belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.resolved = true;
        let mut breaker = self.breaker.lock();
        if breaker.generation == self.generation {
            breaker.on_success(&self.service);
        }
    }

    /// Records a failed call.
    pub fn failure(mut self) {
        self.resolved = true;
        let mut breaker = self.breaker.lock();
        if breaker.generation == self.generation {
            breaker.on_failure(&self.service, Instant::now());
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.resolved || !self.probe {
            return;
        }
        let mut breaker = self.breaker.lock();
        if breaker.generation == self.generation && breaker.state == CircuitState::HalfOpen {
            debug!(service = %self.service, "Probe abandoned");
            breaker.on_failure(&self.service, Instant::now());
        }
    }
}

/// Registry of breakers keyed by service name.
///
/// Breakers are created on first use with the default settings, or with
/// the settings given to [`configure`](Self::configure).
///
/// # Example
///
/// ```
/// use bastion_runtime::recovery::{BreakerSettings, CircuitBreakerRegistry, CircuitState};
/// use std::time::Duration;
///
/// let registry = CircuitBreakerRegistry::new(BreakerSettings {
///     failure_threshold: 2,
///     recovery_timeout: Duration::from_secs(60),
///     success_threshold: 1,
/// });
/// registry.record_failure("billing");
/// registry.record_failure("billing");
/// assert_eq!(registry.state("billing"), CircuitState::Open);
/// assert!(registry.check("billing").is_err());
/// assert_eq!(registry.state("search"), CircuitState::Closed);
/// ```
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerSettings,
    overrides: DashMap<String, BreakerSettings>,
    breakers: DashMap<String, Arc<Mutex<Breaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates a registry with `defaults` for every service.
    #[must_use]
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            defaults,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Overrides the settings for one service.
    ///
    /// An existing breaker keeps its state and uses the new thresholds from
    /// the next transition on.
    pub fn configure(&self, service: impl Into<String>, settings: BreakerSettings) {
        let service = service.into();
        if let Some(existing) = self.breakers.get(&service) {
            existing.value().lock().settings = settings;
        }
        self.overrides.insert(service, settings);
    }

    fn breaker(&self, service: &str) -> Arc<Mutex<Breaker>> {
        if let Some(existing) = self.breakers.get(service) {
            return Arc::clone(existing.value());
        }
        let settings = self
            .overrides
            .get(service)
            .map(|s| *s.value())
            .unwrap_or(self.defaults);
        let entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(settings))));
        Arc::clone(entry.value())
    }

    /// Asks to make one call to `service`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] while the circuit is open, or while it
    /// is half-open and the probe is already in flight.
    pub fn check(&self, service: &str) -> Result<CallPermit, CircuitOpenError> {
        let breaker = self.breaker(service);
        let admitted = {
            let mut guard = breaker.lock();
            guard
                .admit(service, Instant::now())
                .map(|probe| (probe, guard.generation))
        };
        match admitted {
            Ok((probe, generation)) => Ok(CallPermit {
                service: service.to_string(),
                breaker,
                generation,
                probe,
                resolved: false,
            }),
            Err(retry_after) => {
                debug!(service, ?retry_after, "Call rejected by open circuit");
                Err(CircuitOpenError {
                    service: service.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Records a success outside a permit.
    pub fn record_success(&self, service: &str) {
        let breaker = self.breaker(service);
        let mut guard = breaker.lock();
        guard.refresh(service, Instant::now());
        guard.on_success(service);
    }

    /// Records a failure outside a permit. Ignored while open.
    pub fn record_failure(&self, service: &str) {
        let breaker = self.breaker(service);
        let now = Instant::now();
        let mut guard = breaker.lock();
        guard.refresh(service, now);
        guard.on_failure(service, now);
    }

    /// Current state. Unknown services are closed.
    #[must_use]
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers.get(service).map_or(CircuitState::Closed, |entry| {
            let mut guard = entry.value().lock();
            guard.refresh(service, Instant::now());
            guard.state
        })
    }

    /// All known breakers, sorted by service name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let mut guard = entry.value().lock();
                guard.refresh(entry.key(), now);
                BreakerSnapshot {
                    service: entry.key().clone(),
                    state: guard.state,
                    failures: guard.failures,
                    retry_after: (guard.state == CircuitState::Open).then(|| guard.remaining(now)),
                }
            })
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    /// Runs `call` through the breaker for `service`.
    ///
    /// `call` is not invoked while the circuit is open.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] without invoking `call` when rejected.
    pub async fn call<F, Fut, T, E>(&self, service: &str, call: F) -> Result<Result<T, E>, CircuitOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.check(service)?;
        let result = call().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(failure_threshold: u32, success_threshold: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold,
            recovery_timeout: Duration::from_secs(10),
            success_threshold,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_fails_fast() {
        let registry = CircuitBreakerRegistry::new(settings(3, 1));
        for _ in 0..2 {
            registry.record_failure("svc");
            assert_eq!(registry.state("svc"), CircuitState::Closed);
        }
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = registry
            .call("svc", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            })
            .await
            .expect_err("fail fast");
        assert_eq!(err.service, "svc");
        assert_eq!(err.retry_after, Duration::from_secs(10));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe() {
        let registry = CircuitBreakerRegistry::new(settings(1, 1));
        registry.record_failure("svc");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        let probe = registry.check("svc").expect("probe admitted");
        assert!(probe.is_probe());
        let second = registry.check("svc").expect_err("probe in flight");
        assert_eq!(second.retry_after, Duration::ZERO);

        probe.success();
        assert_eq!(registry.state("svc"), CircuitState::Closed);
        assert!(!registry.check("svc").expect("closed").is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_timeout() {
        let registry = CircuitBreakerRegistry::new(settings(1, 1));
        registry.record_failure("svc");
        tokio::time::advance(Duration::from_secs(10)).await;

        registry.check("svc").expect("probe").failure();
        assert_eq!(registry.state("svc"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(registry.state("svc"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_counts_as_failure() {
        let registry = CircuitBreakerRegistry::new(settings(1, 1));
        registry.record_failure("svc");
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(registry.check("svc").expect("probe"));
        assert_eq!(registry.state("svc"), CircuitState::Open);
    }

    #[tokio::test]
    async fn dropped_closed_permit_records_nothing() {
        let registry = CircuitBreakerRegistry::new(settings(1, 1));
        drop(registry.check("svc").expect("closed"));
        assert_eq!(registry.state("svc"), CircuitState::Closed);
        assert_eq!(registry.snapshot()[0].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_threshold_needs_several_probes() {
        let registry = CircuitBreakerRegistry::new(settings(1, 2));
        registry.record_failure("svc");
        tokio::time::advance(Duration::from_secs(10)).await;

        registry.check("svc").expect("first probe").success();
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);
        registry.check("svc").expect("second probe").success();
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_permit_is_ignored() {
        let registry = CircuitBreakerRegistry::new(settings(2, 1));
        let slow = registry.check("svc").expect("closed");
        registry.record_failure("svc");
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        // Issued before the circuit opened; must not decide the half-open state.
        slow.failure();
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);
    }

    #[test]
    fn success_resets_failures_while_closed() {
        let registry = CircuitBreakerRegistry::new(settings(3, 1));
        registry.record_failure("svc");
        registry.record_failure("svc");
        registry.record_success("svc");
        registry.record_failure("svc");
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[test]
    fn overrides_apply_per_service() {
        let registry = CircuitBreakerRegistry::new(settings(5, 1));
        registry.configure("fragile", settings(1, 1));
        registry.record_failure("fragile");
        registry.record_failure("sturdy");
        assert_eq!(registry.state("fragile"), CircuitState::Open);
        assert_eq!(registry.state("sturdy"), CircuitState::Closed);

        let snap = registry.snapshot();
        let names: Vec<&str> = snap.iter().map(|s| s.service.as_str()).collect();
        assert_eq!(names, vec!["fragile", "sturdy"]);
        assert!(snap[0].retry_after.is_some());
        assert!(snap[1].retry_after.is_none());
    }

    #[test]
    fn error_code() {
        let err = CircuitOpenError {
            service: "x".into(),
            retry_after: Duration::ZERO,
        };
        bastion_types::assert_error_code(&err, "CIRCUIT_");
        assert!(err.is_recoverable());
    }

    #[test]
    fn concurrent_failures_open_exactly_once() {
        let registry = Arc::new(CircuitBreakerRegistry::new(settings(50, 1)));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        registry.record_failure("shared");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread");
        }
        let snap = registry.snapshot();
        assert_eq!(snap[0].state, CircuitState::Open);
        assert_eq!(snap[0].failures, 50);
    }

    proptest! {
        #[test]
        fn closed_breaker_never_overcounts(
            threshold in 1u32..6,
            outcomes in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let registry = CircuitBreakerRegistry::new(BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(3_600),
                success_threshold: 1,
            });
            let mut model_failures = 0u32;
            let mut model_open = false;
            for ok in outcomes {
                if ok {
                    registry.record_success("p");
                    if !model_open {
                        model_failures = 0;
                    }
                } else {
                    registry.record_failure("p");
                    if !model_open {
                        model_failures += 1;
                        model_open = model_failures >= threshold;
                    }
                }
                let snap = registry.snapshot();
                prop_assert!(snap[0].failures <= threshold);
                prop_assert_eq!(snap[0].failures, model_failures);
                let expected = if model_open { CircuitState::Open } else { CircuitState::Closed };
                prop_assert_eq!(snap[0].state, expected);
            }
        }
    }
}
