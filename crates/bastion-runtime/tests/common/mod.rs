//! Shared fixtures for coordinator integration tests.

#![allow(dead_code)]

use bastion_auth::{
    AuditSink, InMemoryPermissionStore, InboundMessage, MemoryAuditLog, MessageSignature,
    PermissionStore, SignatureAlgorithm,
};
use bastion_event::SystemEvent;
use bastion_runtime::config::BastionConfig;
use bastion_runtime::coordinator::{CoordinatorBuilder, OperationCoordinator};
use bastion_runtime::eventbus::{handler_fn, HandlerError};
use bastion_runtime::sandbox::SandboxTask;
use bastion_types::Principal;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

/// Installs a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub coordinator: Arc<OperationCoordinator>,
    pub audit: Arc<MemoryAuditLog>,
    pub store: Arc<InMemoryPermissionStore>,
}

pub fn harness(config: BastionConfig) -> Harness {
    init_tracing();
    let audit = Arc::new(MemoryAuditLog::new());
    let store = Arc::new(InMemoryPermissionStore::new());
    let coordinator = CoordinatorBuilder::new(config)
        .permissions(Arc::clone(&store) as Arc<dyn PermissionStore>)
        .verifier(Arc::new(
            |_: SignatureAlgorithm, key: &[u8], _: &[u8], _: &[u8]| key == b"trusted",
        ))
        .audit(Arc::clone(&audit) as Arc<dyn AuditSink>)
        .build()
        .expect("valid config");
    Harness {
        coordinator: Arc::new(coordinator),
        audit,
        store,
    }
}

pub fn signed(service: &str) -> InboundMessage {
    InboundMessage::signed(
        Principal::service(service),
        "payload",
        MessageSignature::new("EdDSA", b"trusted".to_vec(), b"sig".to_vec()),
    )
}

pub fn anonymous() -> InboundMessage {
    InboundMessage::unsigned(Principal::Anonymous, "payload")
}

pub fn ok_task(_: u32) -> SandboxTask {
    SandboxTask::new("ok", |_| async { Ok(json!("done")) })
}

/// Records every event the bus delivers for `pattern`.
pub fn record(coordinator: &OperationCoordinator, pattern: &str) -> Arc<Mutex<Vec<Arc<SystemEvent>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    coordinator
        .events()
        .subscribe(
            pattern,
            handler_fn(move |event: Arc<SystemEvent>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(event);
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .expect("valid pattern");
    seen
}
