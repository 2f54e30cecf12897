//! Subscription patterns over event types.
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*` | every event |
//! | `operation_started` | that type only |
//! | `operation_*` | `operation_started`, `operation_failed`, ... |
//! | `lock.?eased` | glob syntax from the `glob` crate |

use crate::EventError;
use std::fmt;

/// Compiled subscription pattern.
///
/// # Example
///
/// ```
/// use bastion_event::EventPattern;
///
/// let p = EventPattern::parse("operation_*").expect("valid glob");
/// assert!(p.matches("operation_started"));
/// assert!(!p.matches("lock_acquired"));
///
/// assert!(EventPattern::Any.matches("anything"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Matches every event type.
    Any,
    /// Matches one event type exactly.
    Exact(String),
    /// Glob over the event type.
    Glob(glob::Pattern),
}

impl EventPattern {
    /// Parses a pattern string.
    ///
    /// Strings without glob metacharacters compile to [`EventPattern::Exact`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] for malformed globs and empty input.
    pub fn parse(pattern: &str) -> Result<Self, EventError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(EventError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }
        if trimmed == "*" {
            return Ok(Self::Any);
        }
        if !trimmed.contains(['*', '?', '[']) {
            return Ok(Self::Exact(trimmed.to_string()));
        }
        glob::Pattern::new(trimmed)
            .map(Self::Glob)
            .map_err(|e| EventError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.msg.to_string(),
            })
    }

    /// Returns `true` if `event_type` matches.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => t == event_type,
            Self::Glob(p) => p.matches(event_type),
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(t) => f.write_str(t),
            Self::Glob(p) => f.write_str(p.as_str()),
        }
    }
}
