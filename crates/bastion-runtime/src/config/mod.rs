//! Configuration management with hierarchical layering.
//!
//! # Architecture
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌─────────────────────────────────────────┐
//! │  1. Environment Variables (BASTION_*)   │  Runtime override
//! ├─────────────────────────────────────────┤
//! │  2. Config files (last added wins)      │  Deployment settings
//! ├─────────────────────────────────────────┤
//! │  3. Default Values (compile-time)       │  Fallback
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Config Field | Type |
//! |----------|--------------|------|
//! | `BASTION_SANDBOX_MAX_SANDBOXES` | `sandbox.max_sandboxes` | usize |
//! | `BASTION_SANDBOX_MAX_DURATION_SEC` | `sandbox.max_duration_sec` | u64 |
//! | `BASTION_LOCK_LEASE_MS` | `locks.lease_ms` | u64 |
//! | `BASTION_LOCK_ACQUIRE_TIMEOUT_MS` | `locks.acquire_timeout_ms` | u64 |
//! | `BASTION_BREAKER_FAILURE_THRESHOLD` | `breaker.failure_threshold` | u32 |
//! | `BASTION_BREAKER_RECOVERY_TIMEOUT_MS` | `breaker.recovery_timeout_ms` | u64 |
//! | `BASTION_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` | u32 |
//! | `BASTION_RETRY_BASE_DELAY_MS` | `retry.base_delay_ms` | u64 |
//! | `BASTION_RETRY_BACKOFF` | `retry.backoff` | `exponential` / `linear` / `fixed` |
//! | `BASTION_EVENTS_MAX_REDELIVERIES` | `events.max_redeliveries` | u32 |
//! | `BASTION_CONSENT_THRESHOLD` | `consent.threshold` | risk level |
//!
//! # Example Configuration
//!
//! ```toml
//! [sandbox]
//! max_memory_mb = 2048
//! max_duration_sec = 120
//! max_sandboxes = 32
//!
//! [locks]
//! lease_ms = 300000
//! acquire_timeout_ms = 5000
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 30000
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! backoff = "exponential"
//!
//! [retention]
//! checkpoint_max_count = 1024
//! checkpoint_max_age_secs = 3600
//! audit_capacity = 10000
//!
//! [consent]
//! threshold = "critical"
//! timeout_ms = 60000
//! ```

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use types::{
    BastionConfig, BreakerConfig, ConsentConfig, EventsConfig, LockConfig, RetentionConfig,
    RetryConfig, SandboxCapsConfig,
};
