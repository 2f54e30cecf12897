//! Configuration loader with hierarchical merging.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Config files, in the order they were added
//! 3. Environment variables (`BASTION_*`)
//!
//! Each layer overrides the previous.

use super::{BastionConfig, ConfigError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Helper macro for parsing environment variables through [`FromStr`].
macro_rules! parse_env {
    ($field:expr, $var:literal, $expected:literal) => {
        if let Ok(val) = std::env::var($var) {
            $field = parse_value(&val).ok_or_else(|| ConfigError::invalid_env_var($var, $expected))?;
        }
    };
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```
/// use bastion_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .skip_env_vars()
///     .load()
///     .expect("defaults always load");
/// assert_eq!(config.retry.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Config files, lowest priority first.
    files: Vec<PathBuf>,

    /// Skip environment variable loading.
    skip_env: bool,

    /// Fail when a listed file does not exist.
    require_files: bool,
}

impl ConfigLoader {
    /// Creates a new loader with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a config file layer. Later files override earlier ones.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Treats missing config files as errors instead of skipping them.
    #[must_use]
    pub fn require_files(mut self) -> Self {
        self.require_files = true;
        self
    }

    /// Skips environment variable loading.
    ///
    /// Useful for testing with deterministic config.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Loads, merges and validates configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a file cannot be read or parsed, an
    /// environment variable is malformed, or the merged result fails
    /// [`BastionConfig::validate`].
    pub fn load(&self) -> Result<BastionConfig, ConfigError> {
        let mut config = BastionConfig::default();

        for path in &self.files {
            if let Some(layer) = self.load_file(path)? {
                debug!(path = %path.display(), "Loaded config file");
                config.merge(&layer);
            }
        }

        if !self.skip_env {
            apply_env_vars(&mut config)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<BastionConfig>, ConfigError> {
        if !path.exists() && !self.require_files {
            debug!(path = %path.display(), "Config file not found, skipping");
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

        let config =
            BastionConfig::from_toml(&content).map_err(|e| ConfigError::parse_toml(path, e))?;

        Ok(Some(config))
    }
}

/// Applies environment variable overrides.
fn apply_env_vars(config: &mut BastionConfig) -> Result<(), ConfigError> {
    parse_env!(config.sandbox.max_sandboxes, "BASTION_SANDBOX_MAX_SANDBOXES", "expected integer");
    parse_env!(config.sandbox.max_duration_sec, "BASTION_SANDBOX_MAX_DURATION_SEC", "expected integer");

    parse_env!(config.locks.lease_ms, "BASTION_LOCK_LEASE_MS", "expected integer");
    parse_env!(config.locks.acquire_timeout_ms, "BASTION_LOCK_ACQUIRE_TIMEOUT_MS", "expected integer");

    parse_env!(config.breaker.failure_threshold, "BASTION_BREAKER_FAILURE_THRESHOLD", "expected integer");
    parse_env!(config.breaker.recovery_timeout_ms, "BASTION_BREAKER_RECOVERY_TIMEOUT_MS", "expected integer");

    parse_env!(config.retry.max_attempts, "BASTION_RETRY_MAX_ATTEMPTS", "expected integer");
    parse_env!(config.retry.base_delay_ms, "BASTION_RETRY_BASE_DELAY_MS", "expected integer");
    parse_env!(config.retry.backoff, "BASTION_RETRY_BACKOFF", "expected exponential, linear or fixed");

    parse_env!(config.events.max_redeliveries, "BASTION_EVENTS_MAX_REDELIVERIES", "expected integer");
    parse_env!(config.consent.threshold, "BASTION_CONSENT_THRESHOLD", "expected low, medium, high or critical");

    Ok(())
}

fn parse_value<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}
