//! Event layer for Bastion.
//!
//! Defines the immutable [`SystemEvent`] published on the EventBus and the
//! [`EventPattern`] subscribers use to select events by type. Delivery
//! itself lives in `bastion-runtime`.
//!
//! # Lifecycle Events
//!
//! The coordinator publishes these for every operation:
//!
//! | Constant | Published when |
//! |----------|----------------|
//! | [`OPERATION_STARTED`] | locks are held, before execution |
//! | [`OPERATION_COMPLETED`] | execution (or recovery) succeeded |
//! | [`OPERATION_FAILED`] | the operation returns an error after locking |

mod error;
mod event;
mod pattern;

pub use error::EventError;
pub use event::{EventMetadata, SecurityContext, SystemEvent, SystemEventBuilder};
pub use pattern::EventPattern;

/// Event type published when an operation begins executing.
pub const OPERATION_STARTED: &str = "operation_started";

/// Event type published when an operation finishes successfully.
pub const OPERATION_COMPLETED: &str = "operation_completed";

/// Event type published when an operation fails after `operation_started`.
pub const OPERATION_FAILED: &str = "operation_failed";
