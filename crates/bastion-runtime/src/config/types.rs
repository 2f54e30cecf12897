//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use crate::recovery::{Backoff, BreakerSettings, RetentionPolicy, RetryPolicy};
use crate::sandbox::SandboxCaps;
use bastion_types::RiskLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Overrides `$self.$field` with `$other.$field` when the latter differs
/// from the default.
macro_rules! merge_fields {
    ($self:ident, $other:ident, $default:ident, [$($field:ident),+ $(,)?]) => {
        $(
            if $other.$field != $default.$field {
                $self.$field = $other.$field.clone();
            }
        )+
    };
}

/// Main configuration structure.
///
/// This is the unified configuration after merging all layers.
///
/// # Example
///
/// ```
/// use bastion_runtime::config::BastionConfig;
///
/// let config = BastionConfig::default();
/// assert_eq!(config.locks.lease_ms, 300_000);
/// assert_eq!(config.breaker.failure_threshold, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BastionConfig {
    /// System-wide sandbox caps.
    pub sandbox: SandboxCapsConfig,

    /// Lease settings.
    pub locks: LockConfig,

    /// Default circuit breaker settings.
    pub breaker: BreakerConfig,

    /// Default retry policy.
    pub retry: RetryConfig,

    /// Checkpoint and audit retention.
    pub retention: RetentionConfig,

    /// Event delivery.
    pub events: EventsConfig,

    /// Consent boundary.
    pub consent: ConsentConfig,
}

impl BastionConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only if they
    /// differ from the default.
    pub fn merge(&mut self, other: &Self) {
        self.sandbox.merge(&other.sandbox);
        self.locks.merge(&other.locks);
        self.breaker.merge(&other.breaker);
        self.retry.merge(&other.retry);
        self.retention.merge(&other.retention);
        self.events.merge(&other.events);
        self.consent.merge(&other.consent);
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`](super::ConfigError::Invalid) for the
    /// first violated constraint.
    pub fn validate(&self) -> Result<(), super::ConfigError> {
        use super::ConfigError;

        let positive: [(&str, u64); 10] = [
            ("sandbox.max_sandboxes", self.sandbox.max_sandboxes as u64),
            ("sandbox.max_duration_sec", self.sandbox.max_duration_sec),
            ("locks.lease_ms", self.locks.lease_ms),
            ("breaker.failure_threshold", u64::from(self.breaker.failure_threshold)),
            ("breaker.success_threshold", u64::from(self.breaker.success_threshold)),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
            ("retention.checkpoint_max_count", self.retention.checkpoint_max_count as u64),
            ("retention.checkpoint_max_age_secs", self.retention.checkpoint_max_age_secs),
            ("retention.audit_capacity", self.retention.audit_capacity as u64),
            ("consent.timeout_ms", self.consent.timeout_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::invalid(*field, "must be greater than zero"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        let longest_hold = self
            .sandbox
            .max_duration_sec
            .saturating_mul(1_000)
            .saturating_add(self.retry.max_delay_ms);
        if self.locks.lease_ms <= longest_hold {
            return Err(ConfigError::invalid(
                "locks.lease_ms",
                "must exceed sandbox.max_duration_sec plus retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// System-wide sandbox caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxCapsConfig {
    /// Maximum memory per sandbox.
    pub max_memory_mb: u64,
    /// Maximum CPU share per sandbox (100 = one core).
    pub max_cpu_percent: u32,
    /// Maximum disk per sandbox.
    pub max_disk_mb: u64,
    /// Maximum network bandwidth per sandbox.
    pub max_network_kbps: u64,
    /// Maximum wall-clock duration per execution.
    pub max_duration_sec: u64,
    /// Maximum number of live sandboxes.
    pub max_sandboxes: usize,
}

impl Default for SandboxCapsConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 4_096,
            max_cpu_percent: 400,
            max_disk_mb: 10_240,
            max_network_kbps: 102_400,
            max_duration_sec: 240,
            max_sandboxes: 64,
        }
    }
}

impl SandboxCapsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [
            max_memory_mb,
            max_cpu_percent,
            max_disk_mb,
            max_network_kbps,
            max_duration_sec,
            max_sandboxes,
        ]);
    }

    /// Caps enforced by the sandbox manager.
    #[must_use]
    pub fn caps(&self) -> SandboxCaps {
        SandboxCaps {
            max_memory_mb: self.max_memory_mb,
            max_cpu_percent: self.max_cpu_percent,
            max_disk_mb: self.max_disk_mb,
            max_network_kbps: self.max_network_kbps,
            max_duration_sec: self.max_duration_sec,
            max_sandboxes: self.max_sandboxes,
        }
    }
}

/// Lease settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Default lease length.
    pub lease_ms: u64,
    /// How long the coordinator waits for a contended lock.
    pub acquire_timeout_ms: u64,
    /// Interval of the background reaper.
    pub reap_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 300_000,
            acquire_timeout_ms: 5_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl LockConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [lease_ms, acquire_timeout_ms, reap_interval_ms]);
    }

    /// Default lease as a [`Duration`].
    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Acquire timeout as a [`Duration`].
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Reaper interval as a [`Duration`].
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Default circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe.
    pub recovery_timeout_ms: u64,
    /// Successful probes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            success_threshold: 1,
        }
    }
}

impl BreakerConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [
            failure_threshold,
            recovery_timeout_ms,
            success_threshold,
        ]);
    }

    /// Breaker settings for the registry.
    #[must_use]
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            success_threshold: self.success_threshold,
        }
    }
}

/// Default retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Delay growth.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [max_attempts, base_delay_ms, max_delay_ms, backoff]);
    }

    /// Retry policy for the recovery engine.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
        }
    }
}

/// Checkpoint and audit retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Checkpoints kept before the oldest is evicted.
    pub checkpoint_max_count: usize,
    /// Checkpoints older than this are evicted.
    pub checkpoint_max_age_secs: u64,
    /// Audit records kept by the in-memory audit log.
    pub audit_capacity: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            checkpoint_max_count: 1_024,
            checkpoint_max_age_secs: 3_600,
            audit_capacity: bastion_auth::DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl RetentionConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [
            checkpoint_max_count,
            checkpoint_max_age_secs,
            audit_capacity,
        ]);
    }

    /// Checkpoint age bound as a [`Duration`].
    #[must_use]
    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }

    /// Retention bounds for the in-memory checkpoint store.
    #[must_use]
    pub fn checkpoint_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.checkpoint_max_count,
            max_age: self.checkpoint_max_age(),
        }
    }
}

/// Event delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Extra delivery attempts after a handler fails.
    pub max_redeliveries: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 2,
        }
    }
}

impl EventsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [max_redeliveries]);
    }
}

/// Consent boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsentConfig {
    /// Risk level at or above which the approver is consulted.
    pub threshold: RiskLevel,
    /// How long to wait for the approver before denying.
    pub timeout_ms: u64,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            threshold: RiskLevel::Critical,
            timeout_ms: 60_000,
        }
    }
}

impl ConsentConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [threshold, timeout_ms]);
    }

    /// Approver timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
