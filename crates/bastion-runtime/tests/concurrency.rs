//! Concurrent operations, lease contention and event ordering.

mod common;

use bastion_event::SystemEvent;
use bastion_runtime::config::BastionConfig;
use bastion_runtime::coordinator::{OperationRequest, SandboxProfile};
use bastion_runtime::eventbus::{handler_fn, EventBus, HandlerError};
use bastion_runtime::lock::{LockError, LockManager, LockRequest};
use bastion_runtime::sandbox::{ResourceLimits, SandboxTask};
use bastion_types::{CorrelationId, ResourceId};
use common::{anonymous, harness, init_tracing};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn tracked(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> OperationRequest {
    OperationRequest::new(anonymous(), move |_| {
        let log = Arc::clone(&log);
        SandboxTask::new(name, move |_| async move {
            log.lock().push(format!("{name}:enter"));
            tokio::time::sleep(Duration::from_millis(100)).await;
            log.lock().push(format!("{name}:exit"));
            Ok(json!(name))
        })
    })
    .on_resources(["ledger"])
}

#[tokio::test(start_paused = true)]
async fn operations_on_the_same_resource_do_not_interleave() {
    let h = harness(BastionConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = tokio::join!(
        h.coordinator.execute(tracked("a", Arc::clone(&log))),
        h.coordinator.execute(tracked("b", Arc::clone(&log))),
    );
    a.expect("a completes");
    b.expect("b completes");

    let log = log.lock();
    assert_eq!(log.len(), 4);
    assert!(log[0].ends_with(":enter"));
    assert_eq!(log[1], log[0].replace(":enter", ":exit"));
    assert!(log[2].ends_with(":enter"));
    assert_eq!(log[3], log[2].replace(":enter", ":exit"));
    assert_eq!(h.coordinator.locks().stats().released, 2);
}

#[tokio::test(start_paused = true)]
async fn opposite_resource_orders_do_not_deadlock() {
    let h = harness(BastionConfig::default());
    let slow = |resources: [&'static str; 2]| {
        OperationRequest::new(anonymous(), |_| {
            SandboxTask::new("transfer", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("moved"))
            })
        })
        .on_resources(resources)
    };

    let (a, b) = tokio::join!(
        h.coordinator.execute(slow(["alice", "bob"])),
        h.coordinator.execute(slow(["bob", "alice"])),
    );
    a.expect("first transfer");
    b.expect("second transfer");
    assert!(h.coordinator.locks().holders(&ResourceId::new("alice")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn leases_stay_exclusive_for_the_whole_attempt() {
    let mut config = BastionConfig::default();
    config.sandbox.max_duration_sec = 1;
    config.retry.max_delay_ms = 100;
    config.locks.lease_ms = 1_500;
    let h = harness(config);
    let locks = h.coordinator.locks();

    // "b" frees up at t=1s, so "a" has been held for a second when the task starts
    locks
        .acquire(LockRequest::exclusive("b", "batch-job").with_lease(Duration::from_secs(1)))
        .expect("free");

    let request = OperationRequest::new(anonymous(), |_| {
        SandboxTask::new("rebalance", |_| async {
            tokio::time::sleep(Duration::from_millis(900)).await;
            Ok(json!("balanced"))
        })
    })
    .on_resources(["a", "b"])
    .with_profile(SandboxProfile {
        limits: ResourceLimits {
            max_duration_sec: 1,
            ..ResourceLimits::default()
        },
        ..SandboxProfile::default()
    });

    let (outcome, intruder) = tokio::join!(h.coordinator.execute(request), async {
        // past the unrenewed expiry of "a" (t=1.5s), before the task ends (t=1.9s)
        tokio::time::sleep(Duration::from_millis(1_700)).await;
        locks.acquire(LockRequest::exclusive("a", "intruder"))
    });

    outcome.expect("operation completes");
    assert!(
        matches!(intruder, Err(LockError::Conflict { .. })),
        "exclusive lease must still be held: {intruder:?}"
    );
    assert!(locks.holders(&ResourceId::new("a")).is_empty());
    assert!(locks.stats().renewed >= 2);
}

#[tokio::test(start_paused = true)]
async fn expired_lease_is_reclaimed_by_a_waiter() {
    init_tracing();
    let locks = Arc::new(LockManager::new(Duration::from_secs(30)));
    let stale = locks
        .acquire(LockRequest::exclusive("cache", "crashed-worker").with_lease(Duration::from_millis(200)))
        .expect("free");

    let claimed = locks
        .acquire_within(
            LockRequest::exclusive("cache", "fresh-worker"),
            Duration::from_secs(1),
        )
        .await
        .expect("lease expires while waiting");

    assert!(claimed.fencing_token > stale.fencing_token);
    assert!(locks.release(&ResourceId::new("cache"), "crashed-worker").is_err());
}

#[tokio::test]
async fn each_subscriber_sees_publish_order() {
    init_tracing();
    let bus = EventBus::default();
    let mut logs = Vec::new();
    for _ in 0..3 {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "tick",
            handler_fn(move |event: Arc<SystemEvent>| {
                let sink = Arc::clone(&sink);
                async move {
                    tokio::task::yield_now().await;
                    sink.lock().push(event.data["n"].as_u64());
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .expect("valid pattern");
        logs.push(seen);
    }

    let correlation = CorrelationId::new();
    for n in 0..50u64 {
        let event = SystemEvent::builder("tick", "test", correlation)
            .data(json!({ "n": n }))
            .build()
            .expect("valid event");
        assert_eq!(bus.publish(event).await, 3);
    }
    bus.idle().await;

    let expected: Vec<Option<u64>> = (0..50).map(Some).collect();
    for seen in logs {
        assert_eq!(*seen.lock(), expected);
    }
}
