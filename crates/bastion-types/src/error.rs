//! Unified error-code interface.
//!
//! Every Bastion error enum implements [`ErrorCode`] so that callers,
//! audit sinks and the recovery engine can reason about failures without
//! matching on concrete types.
//!
//! # Code Format
//!
//! | Rule | Example |
//! |------|---------|
//! | UPPER_SNAKE_CASE | `LOCK_CONFLICT` |
//! | Component prefix | `AUTH_`, `SANDBOX_`, `LOCK_`, `CIRCUIT_`, `CHECKPOINT_` |
//! | Stable once published | codes are part of the public contract |
//!
//! # Example
//!
//! ```
//! use bastion_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum StoreError {
//!     Missing,
//!     Busy,
//! }
//!
//! impl ErrorCode for StoreError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::Missing => "STORE_MISSING",
//!             Self::Busy => "STORE_BUSY",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Busy)
//!     }
//! }
//!
//! assert_eq!(StoreError::Busy.code(), "STORE_BUSY");
//! assert!(StoreError::Busy.is_recoverable());
//! ```

/// Machine-readable identity of an error.
pub trait ErrorCode {
    /// Returns the stable, prefixed UPPER_SNAKE_CASE code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying the same call may succeed.
    ///
    /// Caller misuse (bad config, unknown id, wrong holder) and security
    /// failures are never recoverable; timeouts and contention usually are.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code follows the Bastion conventions.
///
/// Intended for tests that walk every variant of an error enum.
///
/// # Panics
///
/// Panics if the code is empty, lacks `expected_prefix`, or is not
/// UPPER_SNAKE_CASE.
///
/// # Example
///
/// ```
/// use bastion_types::{assert_error_code, ErrorCode};
///
/// struct Timeout;
///
/// impl ErrorCode for Timeout {
///     fn code(&self) -> &'static str { "SANDBOX_TIMEOUT" }
///     fn is_recoverable(&self) -> bool { true }
/// }
///
/// assert_error_code(&Timeout, "SANDBOX_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Runs [`assert_error_code`] over a list of errors.
///
/// # Panics
///
/// Panics on the first code that violates the conventions.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
