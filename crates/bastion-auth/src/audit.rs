//! Append-only audit trail.
//!
//! The gate and the recovery engine append [`AuditRecord`]s; nothing in
//! Bastion reads them back except tests and operators.
//!
//! | Sink | Retention |
//! |------|-----------|
//! | [`MemoryAuditLog`] | bounded ring, oldest evicted |
//! | [`TracingAuditSink`] | forwarded to the `bastion::audit` tracing target |

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Default ring capacity of [`MemoryAuditLog`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the audited event happened.
    pub timestamp: DateTime<Utc>,
    /// Event name, e.g. `authentication_failed`.
    pub event: String,
    /// Structured details. Never contains credentials.
    pub details: Value,
}

impl AuditRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn now(event: impl Into<String>, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            details,
        }
    }
}

/// Append-only audit sink.
pub trait AuditSink: Send + Sync {
    /// Appends a record. Must not fail; sinks drop or log on internal errors.
    fn append(&self, record: AuditRecord);
}

/// Bounded in-memory audit log.
///
/// Once `capacity` records are held, each append evicts the oldest one.
/// [`evicted`](Self::evicted) reports how many were dropped.
///
/// # Example
///
/// ```
/// use bastion_auth::{AuditRecord, AuditSink, MemoryAuditLog};
/// use serde_json::json;
///
/// let log = MemoryAuditLog::with_capacity(2);
/// for i in 0..3 {
///     log.append(AuditRecord::now("authentication_failed", json!({"n": i})));
/// }
/// assert_eq!(log.len(), 2);
/// assert_eq!(log.evicted(), 1);
/// assert_eq!(log.records()[0].details["n"], 1);
/// ```
#[derive(Debug)]
pub struct MemoryAuditLog {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    records: VecDeque<AuditRecord>,
    evicted: u64,
}

impl MemoryAuditLog {
    /// Creates a log holding [`DEFAULT_AUDIT_CAPACITY`] records.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Creates a log holding at most `capacity` records (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring::default()),
        }
    }

    /// Snapshot of the held records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    /// Number of held records with the given event name.
    #[must_use]
    pub fn count_event(&self, event: &str) -> usize {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    /// Number of held records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns `true` if nothing has been appended (or everything evicted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records evicted by the capacity bound.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: AuditRecord) {
        let mut ring = self.inner.lock();
        if ring.records.len() >= self.capacity {
            ring.records.pop_front();
            ring.evicted += 1;
        }
        ring.records.push_back(record);
    }
}

/// Forwards audit records to `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, record: AuditRecord) {
        tracing::info!(
            target: "bastion::audit",
            event = %record.event,
            timestamp = %record.timestamp,
            details = %record.details,
            "audit"
        );
    }
}
