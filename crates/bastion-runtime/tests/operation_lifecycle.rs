//! End-to-end operation flows through the coordinator.

mod common;

use bastion_auth::{Actions, Permission};
use bastion_event::{OPERATION_COMPLETED, OPERATION_FAILED, OPERATION_STARTED};
use bastion_runtime::config::BastionConfig;
use bastion_runtime::coordinator::OperationRequest;
use bastion_runtime::recovery::{Backoff, CircuitState};
use bastion_runtime::sandbox::{SandboxTask, TaskError};
use bastion_types::{ErrorCode, Principal, ResourceId};
use common::{anonymous, harness, ok_task, record, signed};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn failed_operation_publishes_started_then_failed_and_releases_each_lock_once() {
    let h = harness(BastionConfig::default());
    h.store.grant(
        Principal::service("importer"),
        Permission::new("*", Actions::READ | Actions::WRITE),
    );
    let seen = record(&h.coordinator, "operation_*");

    let err = h
        .coordinator
        .execute(
            OperationRequest::new(signed("importer"), |_| {
                SandboxTask::new("import", |_| async { Err(TaskError::permanent("malformed row")) })
            })
            .on_resources(["B", "A"])
            .requires(Actions::WRITE),
        )
        .await
        .expect_err("task fails");
    h.coordinator.events().idle().await;

    assert_eq!(err.code(), "SANDBOX_TASK_FAILED");
    assert_eq!(
        err.context.resources,
        vec![ResourceId::new("A"), ResourceId::new("B")]
    );

    let stats = h.coordinator.locks().stats();
    assert_eq!(stats.granted, 2);
    assert_eq!(stats.released, 2);
    assert!(h.coordinator.locks().holders(&ResourceId::new("A")).is_empty());
    assert!(h.coordinator.locks().holders(&ResourceId::new("B")).is_empty());

    let events = seen.lock();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec![OPERATION_STARTED, OPERATION_FAILED]);
    assert!(!types.contains(&OPERATION_COMPLETED));
    assert_eq!(events[1].metadata.causation_id, Some(events[0].id));
    assert_eq!(events[0].metadata.correlation_id, err.context.correlation_id);
    assert_eq!(events[1].data["error_id"], json!(err.id.to_string()));
}

#[tokio::test]
async fn successful_operation_publishes_completed() {
    let h = harness(BastionConfig::default());
    let seen = record(&h.coordinator, "*");

    let outcome = h
        .coordinator
        .execute(OperationRequest::new(anonymous(), ok_task).on_resources(["reports"]))
        .await
        .expect("read-only operation");
    h.coordinator.events().idle().await;

    let events = seen.lock();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec![OPERATION_STARTED, OPERATION_COMPLETED]);
    assert_eq!(events[1].metadata.causation_id, Some(events[0].id));
    assert_eq!(events[1].metadata.correlation_id, outcome.correlation_id);
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_operation_future_releases_its_locks() {
    let h = harness(BastionConfig::default());
    let request = OperationRequest::new(anonymous(), |_| {
        SandboxTask::new("hang", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        })
    })
    .on_resources(["ledger", "journal"]);

    tokio::select! {
        _ = h.coordinator.execute(request) => panic!("task never finishes"),
        () = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    let stats = h.coordinator.locks().stats();
    assert_eq!(stats.granted, 2);
    assert_eq!(stats.released, 2);
    assert!(h.coordinator.locks().holders(&ResourceId::new("ledger")).is_empty());

    // sandbox teardown is scheduled on the runtime
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.coordinator.sandboxes().live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_three_failures_and_recovers_after_timeout() {
    let mut config = BastionConfig::default();
    config.breaker.failure_threshold = 3;
    config.breaker.recovery_timeout_ms = 1_000;
    let h = harness(config);

    let calls = Arc::new(AtomicU32::new(0));
    let failing = || {
        let calls = Arc::clone(&calls);
        OperationRequest::new(anonymous(), move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            SandboxTask::new("charge", |_| async { Err(TaskError::permanent("card declined")) })
        })
        .targeting("payments")
    };

    for _ in 0..3 {
        h.coordinator.execute(failing()).await.expect_err("declined");
    }
    let breakers = h.coordinator.recovery().breakers();
    assert_eq!(breakers.state("payments"), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = h.coordinator.execute(failing()).await.expect_err("open");
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not run the task");

    tokio::time::advance(Duration::from_millis(1_001)).await;
    h.coordinator
        .execute(OperationRequest::new(anonymous(), ok_task).targeting("payments"))
        .await
        .expect("half-open trial succeeds");
    assert_eq!(breakers.state("payments"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let mut config = BastionConfig::default();
    config.retry.base_delay_ms = 100;
    config.retry.backoff = Backoff::Exponential;
    let h = harness(config);

    let starts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&starts);
    let outcome = h
        .coordinator
        .execute(OperationRequest::new(anonymous(), move |attempt| {
            log.lock().push(Instant::now());
            SandboxTask::new("sync", move |_| async move {
                if attempt < 3 {
                    Err(TaskError::transient("connection reset"))
                } else {
                    Ok(json!("synced"))
                }
            })
        }))
        .await
        .expect("third attempt succeeds");

    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.recovery, Some("retry"));

    let starts = starts.lock();
    assert_eq!(starts.len(), 3);
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(first_gap >= Duration::from_millis(100), "{first_gap:?}");
    assert!(first_gap < Duration::from_millis(150), "{first_gap:?}");
    assert!(second_gap >= Duration::from_millis(200), "{second_gap:?}");
    assert!(second_gap < Duration::from_millis(250), "{second_gap:?}");
}

#[tokio::test]
async fn rejected_request_publishes_nothing() {
    let h = harness(BastionConfig::default());
    let seen = record(&h.coordinator, "*");

    let err = h
        .coordinator
        .execute(
            OperationRequest::new(anonymous(), ok_task)
                .on_resources(["orders"])
                .requires(Actions::DELETE),
        )
        .await
        .expect_err("anonymous cannot delete");
    h.coordinator.events().idle().await;

    assert_eq!(err.code(), "AUTH_UNAUTHORIZED");
    assert!(seen.lock().is_empty());
    assert_eq!(h.coordinator.locks().stats().granted, 0);
}
