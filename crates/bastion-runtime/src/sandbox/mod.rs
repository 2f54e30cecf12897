//! Isolated execution environments.
//!
//! # Architecture
//!
//! ```text
//! SandboxManager ──────────────► IsolationBackend (trait)
//!   │  caps, registry, timeout        │
//!   │                                 └── InProcessBackend
//!   ▼
//! SandboxSpec ── ResourceLimits / NetworkPolicy / FilesystemPolicy / Actions
//!   ▲
//!   └── SandboxTask (demand, required capabilities, async body)
//! ```
//!
//! The manager validates, registers and times out; the backend isolates.
//! A timed-out sandbox is always torn down and never reused.

mod backend;
mod error;
mod manager;
mod spec;
mod task;

pub use backend::{BackendHandle, InProcessBackend, IsolationBackend};
pub use error::SandboxError;
pub use manager::SandboxManager;
pub use spec::{
    FilesystemPolicy, NetworkPolicy, ResourceDemand, ResourceLimits, SandboxCaps, SandboxSpec,
};
pub use task::{SandboxContext, SandboxTask, TaskError, TaskFuture};
