// ABOUTME: Behavioral tests for heartbeat broadcasting, socket recovery and membership
//
// Uses a scripted opener to force transmit failures, and real loopback UDP
// between a HeartbeatService and a HeartbeatListener.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use clustercast::transport::{
    Announcement, DatagramTransport, HeartbeatBroadcaster, HeartbeatConfig, HeartbeatError,
    HeartbeatListener, HeartbeatService, HeartbeatState, MessageCatalog, TransportMetrics,
    TransportOpener,
};

/// Transport that fails every send once `broken` is set
struct SwitchableTransport {
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl DatagramTransport for SwitchableTransport {
    async fn send_to(&self, payload: &[u8], _target: SocketAddr) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "link down"))
        } else {
            Ok(payload.len())
        }
    }
}

/// Opener counting opens; each transport shares the same failure switch
#[derive(Clone, Default)]
struct CountingOpener {
    opens: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl TransportOpener for CountingOpener {
    async fn open(&self, _config: &HeartbeatConfig) -> io::Result<Box<dyn DatagramTransport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SwitchableTransport {
            broken: Arc::clone(&self.broken),
        }))
    }
}

fn loopback_config(port: u16) -> HeartbeatConfig {
    HeartbeatConfig {
        group_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        local_interface: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        interval: Duration::from_millis(20),
        expiry: Duration::from_millis(200),
        ..HeartbeatConfig::default()
    }
}

/// Test 1: A transmit failure discards the socket; the next send reopens it
#[tokio::test]
async fn test_broadcaster_recovers_after_transmit_failure() {
    let opener = CountingOpener::default();
    let metrics = Arc::new(TransportMetrics::new());
    let mut hb = HeartbeatBroadcaster::new(opener.clone(), MessageCatalog::builtin().shared(), Arc::clone(&metrics));
    hb.init(loopback_config(9));
    let beat = Announcement::new(4, 1, 8080);

    hb.broadcast_heartbeat(&beat).await.unwrap();
    assert_eq!(hb.state(), HeartbeatState::Ready);
    assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

    opener.broken.store(true, Ordering::SeqCst);
    let err = hb.broadcast_heartbeat(&beat).await.unwrap_err();
    assert!(matches!(err, HeartbeatError::SendFailed { .. }));
    assert_eq!(err.code(), -1);
    assert_eq!(hb.state(), HeartbeatState::Failed);
    assert!(!hb.is_open(), "Failed socket should be discarded");

    opener.broken.store(false, Ordering::SeqCst);
    hb.broadcast_heartbeat(&beat).await.unwrap();
    assert_eq!(hb.state(), HeartbeatState::Ready);
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.heartbeats_sent, 2);
    assert_eq!(snapshot.heartbeats_failed, 1);
    assert_eq!(snapshot.heartbeat_reopens, 1);
}

/// Test 2: Sending before init fails without opening anything
#[tokio::test]
async fn test_send_before_init_is_rejected() {
    let opener = CountingOpener::default();
    let mut hb = HeartbeatBroadcaster::new(
        opener.clone(),
        MessageCatalog::builtin().shared(),
        Arc::new(TransportMetrics::new()),
    );

    let err = hb.send("v=1&ready=0&busy=0&port=1").await.unwrap_err();

    assert!(matches!(err, HeartbeatError::NotInitialized(_)));
    assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
}

/// Test 3: Announcements from a running service populate the listener's membership
#[tokio::test]
async fn test_service_announcements_reach_listener() {
    let mut listener = HeartbeatListener::new(loopback_config(0));
    let bound = listener.start().await.unwrap();

    let mut hb = HeartbeatBroadcaster::multicast(
        MessageCatalog::builtin().shared(),
        Arc::new(TransportMetrics::new()),
    );
    hb.init(loopback_config(bound.port()));
    let mut service = HeartbeatService::new(Duration::from_millis(20));
    service.start(hb, || Announcement::new(7, 2, 41000));

    let mut peers = Vec::new();
    for _ in 0..100 {
        peers = listener.live_peers();
        if !peers.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    service.stop().await;

    assert_eq!(peers.len(), 1);
    let member = &peers[0];
    assert_eq!(member.addr, SocketAddr::from(([127, 0, 0, 1], 41000)));
    assert_eq!(member.liveness.ready, Some(7));
    assert_eq!(member.liveness.busy, Some(2));

    // Silent past expiry: forgotten
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(listener.live_peers().is_empty());

    listener.stop().await;
}
