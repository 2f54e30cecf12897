//! System events.
//!
//! A [`SystemEvent`] is an append-only notification: once published it is
//! shared behind an `Arc` and never mutated. Every event carries
//! [`EventMetadata`] linking it to the logical operation that produced it.
//!
//! # Correlation
//!
//! ```text
//! operation_started   (corr: C, causation: -)
//!        │
//!        └── operation_completed  (corr: C, causation: started.id)
//! ```

use bastion_types::{CorrelationId, EventId, Principal, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EventError;

/// Identity and risk of the caller an event was produced for.
///
/// Holds classification data only, never credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Caller identity.
    pub principal: Principal,
    /// Whether the caller's signature was verified.
    pub authenticated: bool,
    /// Risk level assigned at authentication.
    pub risk_level: RiskLevel,
}

impl SecurityContext {
    /// Context for internal events not attributable to a caller.
    #[must_use]
    pub fn system() -> Self {
        Self {
            principal: Principal::System,
            authenticated: true,
            risk_level: RiskLevel::Low,
        }
    }
}

/// Correlation data attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Logical operation this event belongs to.
    pub correlation_id: CorrelationId,
    /// Event that directly caused this one, if any.
    pub causation_id: Option<EventId>,
    /// Caller context.
    pub security_context: SecurityContext,
}

/// An immutable notification delivered through the EventBus.
///
/// # Example
///
/// ```
/// use bastion_event::{SystemEvent, OPERATION_STARTED};
/// use bastion_types::CorrelationId;
/// use serde_json::json;
///
/// let corr = CorrelationId::new();
/// let started = SystemEvent::builder(OPERATION_STARTED, "coordinator", corr)
///     .data(json!({"resources": ["a", "b"]}))
///     .build()
///     .expect("valid event");
///
/// let done = SystemEvent::builder("operation_completed", "coordinator", corr)
///     .caused_by(started.id)
///     .build()
///     .expect("valid event");
///
/// assert_eq!(done.metadata.causation_id, Some(started.id));
/// assert_eq!(done.metadata.correlation_id, started.metadata.correlation_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Unique id.
    pub id: EventId,
    /// Dotted or underscored type name matched by subscription patterns.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Component that produced the event.
    pub source: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub data: Value,
    /// Correlation and security metadata.
    pub metadata: EventMetadata,
}

impl SystemEvent {
    /// Starts building an event.
    #[must_use]
    pub fn builder(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> SystemEventBuilder {
        SystemEventBuilder {
            event_type: event_type.into(),
            source: source.into(),
            correlation_id,
            causation_id: None,
            security_context: SecurityContext::system(),
            data: Value::Null,
        }
    }
}

/// Builder for [`SystemEvent`].
#[derive(Debug, Clone)]
pub struct SystemEventBuilder {
    event_type: String,
    source: String,
    correlation_id: CorrelationId,
    causation_id: Option<EventId>,
    security_context: SecurityContext,
    data: Value,
}

impl SystemEventBuilder {
    /// Sets the payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Records the event that caused this one.
    #[must_use]
    pub fn caused_by(mut self, cause: EventId) -> Self {
        self.causation_id = Some(cause);
        self
    }

    /// Sets the caller context (defaults to [`SecurityContext::system`]).
    #[must_use]
    pub fn security(mut self, ctx: SecurityContext) -> Self {
        self.security_context = ctx;
        self
    }

    /// Finishes the event, stamping id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::EmptyType`] if the event type is blank.
    pub fn build(self) -> Result<SystemEvent, EventError> {
        if self.event_type.trim().is_empty() {
            return Err(EventError::EmptyType);
        }
        Ok(SystemEvent {
            id: EventId::new(),
            event_type: self.event_type,
            source: self.source,
            timestamp: Utc::now(),
            data: self.data,
            metadata: EventMetadata {
                correlation_id: self.correlation_id,
                causation_id: self.causation_id,
                security_context: self.security_context,
            },
        })
    }
}
