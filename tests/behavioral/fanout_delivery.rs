// ABOUTME: Behavioral tests for FanoutSender over the real TCP multi-point sender
//
// Verifies one call reaches every live peer, failures are reported per peer
// (partial vs total), and an exhausted pool fails every destination.

use std::time::Duration;

use clustercast::transport::{FailureKind, FaultCause, Wait};

use crate::fixtures::{dead_peer, tcp_fanout, LivePeer};

/// Test 1: Every live peer receives the message exactly once
#[tokio::test]
async fn test_message_reaches_every_live_peer() {
    let mut a = LivePeer::start().await;
    let mut b = LivePeer::start().await;
    let (sender, metrics) = tcp_fanout(2, Wait::Bounded(Duration::from_millis(500)));

    sender
        .send_to_all(&[a.peer.clone(), b.peer.clone()], b"state-update")
        .await
        .expect("both peers are live");

    assert_eq!(a.next_payload().await, Some(b"state-update".to_vec()));
    assert_eq!(b.next_payload().await, Some(b"state-update".to_vec()));
    assert_eq!(metrics.snapshot().fanout_calls, 1);
    assert_eq!(sender.pool().status().idle, 1, "Sender should be back in the pool");

    a.stop().await;
    b.stop().await;
}

/// Test 2: Consecutive calls reuse the pooled sender and its connections
#[tokio::test]
async fn test_consecutive_sends_reuse_pooled_sender() {
    let mut peer = LivePeer::start().await;
    let (sender, metrics) = tcp_fanout(4, Wait::Bounded(Duration::from_millis(500)));

    for body in [&b"one"[..], b"two", b"three"] {
        sender.send_to_all(std::slice::from_ref(&peer.peer), body).await.unwrap();
    }

    assert_eq!(peer.next_payload().await, Some(b"one".to_vec()));
    assert_eq!(peer.next_payload().await, Some(b"two".to_vec()));
    assert_eq!(peer.next_payload().await, Some(b"three".to_vec()));
    assert_eq!(metrics.snapshot().resources_created, 1);

    peer.stop().await;
}

/// Test 3: Dead peers are reported; live peers still receive the message
#[tokio::test]
async fn test_partial_failure_names_only_dead_peers() {
    let mut live = LivePeer::start().await;
    let dead_one = dead_peer().await;
    let dead_two = dead_peer().await;
    let (sender, metrics) = tcp_fanout(1, Wait::Bounded(Duration::from_millis(500)));

    let report = sender
        .send_to_all(&[dead_one.clone(), live.peer.clone(), dead_two.clone()], b"hello")
        .await
        .unwrap_err();

    assert_eq!(report.kind(), FailureKind::Partial);
    assert_eq!(report.attempted(), 3);
    let mut failed: Vec<_> = report.faulty_peers().cloned().collect();
    failed.sort_by_key(|p| p.addr);
    let mut expected = vec![dead_one, dead_two];
    expected.sort_by_key(|p| p.addr);
    assert_eq!(failed, expected);
    assert!(report
        .faults()
        .iter()
        .all(|f| matches!(f.cause, FaultCause::Connect(_))));

    assert_eq!(live.next_payload().await, Some(b"hello".to_vec()));
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.fanout_partial_failures, 1);
    assert_eq!(snapshot.fault_records, 2);

    live.stop().await;
}

/// Test 4: No sender available within the wait bound fails every destination
#[tokio::test]
async fn test_exhausted_pool_is_total_failure() {
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(LivePeer::start().await);
    }
    let destinations: Vec<_> = peers.iter().map(|p| p.peer.clone()).collect();
    let (sender, metrics) = tcp_fanout(1, Wait::Bounded(Duration::from_millis(50)));

    let _held = sender.pool().acquire(Wait::NoWait).await.unwrap();
    let started = std::time::Instant::now();
    let report = sender.send_to_all(&destinations, b"never sent").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500), "Should give up near the wait bound");
    assert!(report.is_total());
    assert_eq!(report.faults().len(), 3);
    for fault in report.faults() {
        match &fault.cause {
            FaultCause::ResourceUnavailable(message) => assert!(message.contains("50 ms")),
            other => panic!("unexpected cause {other:?}"),
        }
    }
    assert_eq!(metrics.snapshot().fanout_total_failures, 1);

    for peer in &mut peers {
        assert_eq!(peer.next_payload().await, None, "Nothing should have been sent");
    }
}

/// Test 5: An empty destination list succeeds without touching the pool
#[tokio::test]
async fn test_empty_destinations_succeeds() {
    let (sender, metrics) = tcp_fanout(1, Wait::NoWait);

    sender.send_to_all(&[], b"nobody").await.unwrap();

    assert_eq!(metrics.snapshot().fanout_calls, 0);
    assert_eq!(sender.pool().status().idle, 0);
}
