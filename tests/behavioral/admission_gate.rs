// ABOUTME: Behavioral tests for AdmissionGate concurrency control
//
// Verifies the capacity bound under load, the three blocking modes and the
// fallback path taken exactly when admission is denied.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustercast::transport::{AdmissionGate, BlockingMode, DenialReason, GateConfig};

fn gate(capacity: usize, blocking_mode: BlockingMode) -> AdmissionGate {
    AdmissionGate::new(&GateConfig {
        capacity,
        blocking_mode,
        ..GateConfig::default()
    })
    .expect("capacity is positive")
}

/// Test 1: No more than `capacity` operations ever run at once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_never_exceeds_capacity() {
    let gate = gate(3, BlockingMode::BlockUninterruptible);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let gate = gate.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            gate.dispatch(
                move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    true
                },
                |_| false,
            )
            .await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap(), "Blocking mode should admit everyone eventually");
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(gate.available(), 3);
    assert_eq!(gate.metrics().snapshot().gate_granted, 20);
}

/// Test 2: Reject mode runs the fallback with an overload status when full
#[tokio::test]
async fn test_reject_mode_runs_fallback_when_full() {
    let gate = gate(1, BlockingMode::RejectImmediately);
    let _held = gate.try_enter().unwrap();

    let outcome = gate
        .dispatch(
            || async { "handled" },
            |denied| {
                assert_eq!(denied.reason(), DenialReason::AtCapacity);
                assert_eq!(denied.status_code(), None, "No status unless configured");
                "shed"
            },
        )
        .await;

    assert_eq!(outcome, "shed");
    assert_eq!(gate.metrics().snapshot().gate_denied, 1);
}

/// Test 3: Cancelling an interruptible wait denies without consuming a permit
#[tokio::test]
async fn test_interruptible_wait_cancelled() {
    let gate = gate(1, BlockingMode::BlockInterruptible);
    let held = gate.try_enter().unwrap();

    let denied = gate
        .enter_cancellable(tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(denied.reason(), DenialReason::Cancelled);

    held.leave();
    assert_eq!(gate.available(), 1, "Cancelled wait must not leak a permit");
    assert!(gate.try_enter().is_ok());
}

/// Test 4: A blocked waiter is admitted once a permit is handed back
#[tokio::test]
async fn test_blocked_waiter_admitted_after_leave() {
    let gate = gate(1, BlockingMode::BlockUninterruptible);
    let held = gate.try_enter().unwrap();

    let waiter = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.enter().await.map(|permit| permit.leave()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    held.leave();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be admitted")
        .unwrap()
        .unwrap();
}

/// Test 5: Uncontrolled keys bypass the gate entirely
#[tokio::test]
async fn test_uncontrolled_keys_bypass_gate() {
    let gate = gate(1, BlockingMode::RejectImmediately).with_controls(|key| key.starts_with("cluster/"));
    let _held = gate.try_enter().unwrap();

    let gated = gate
        .dispatch_for("cluster/replicate", || async { true }, |_| false)
        .await;
    let bypassed = gate.dispatch_for("static/logo.png", || async { true }, |_| false).await;

    assert!(!gated);
    assert!(bypassed);
}
