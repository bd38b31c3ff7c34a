// ABOUTME: Shared test fixtures and utilities for behavioral tests
//
// Provides:
// - CountingFactory: in-memory resources with creation/close counters and
//   separate validity and keepalive switches
// - LivePeer: a running FrameReceiver bound to loopback
// - dead_peer(): an address nothing listens on
// - tcp_fanout(): FanoutSender over the real TCP sender

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use clustercast::transport::{
    FanoutSender, FrameReceiver, MessageCatalog, Peer, PoolConfig, PooledResource, ReceivedFrame,
    ResourceFactory, ResourcePool, SenderConfig, TcpSenderFactory, TransportMetrics, Wait,
};

// === In-memory resources ===

#[derive(Debug)]
pub struct Counted {
    pub serial: usize,
    pub healthy: Arc<AtomicBool>,
    pub answering: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PooledResource for Counted {
    fn is_valid(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn keepalive(&mut self) -> io::Result<()> {
        if self.answering.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer stopped answering"))
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory whose resources report creations and closes
#[derive(Debug, Default, Clone)]
pub struct CountingFactory {
    pub created: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    /// New resources start out invalid while set
    pub born_invalid: Arc<AtomicBool>,
}

impl CountingFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFactory for CountingFactory {
    type Resource = Counted;

    async fn create(&self) -> io::Result<Counted> {
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Counted {
            serial,
            healthy: Arc::new(AtomicBool::new(!self.born_invalid.load(Ordering::SeqCst))),
            answering: Arc::new(AtomicBool::new(true)),
            closed: Arc::clone(&self.closed),
        })
    }
}

pub fn pool_config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        max_wait_millis: 1000,
        keepalive_interval: Duration::from_secs(60),
        reaper_interval: Duration::from_secs(60),
        reaper_enabled: false,
    }
}

// === Loopback peers ===

/// A frame receiver running on an ephemeral loopback port
pub struct LivePeer {
    pub peer: Peer,
    pub frames: mpsc::Receiver<ReceivedFrame>,
    receiver: FrameReceiver,
}

impl LivePeer {
    pub async fn start() -> Self {
        let mut receiver = FrameReceiver::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        let (addr, frames) = receiver.start().await.expect("receiver should bind");
        Self {
            peer: Peer::new(addr),
            frames,
            receiver,
        }
    }

    /// Next payload, or None if nothing arrives within a second
    pub async fn next_payload(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(Duration::from_secs(1), self.frames.recv())
            .await
            .ok()
            .flatten()
            .map(|(_, payload)| payload)
    }

    pub async fn stop(mut self) {
        self.receiver.stop().await.expect("receiver should stop");
    }
}

/// Address nothing listens on
pub async fn dead_peer() -> Peer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Peer::new(addr)
}

/// Fan-out sender over a TCP sender pool of `max_size`
pub fn tcp_fanout(max_size: usize, wait: Wait) -> (FanoutSender<TcpSenderFactory>, Arc<TransportMetrics>) {
    let metrics = Arc::new(TransportMetrics::new());
    let catalog = MessageCatalog::builtin().shared();
    let sender_config = SenderConfig {
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
    };
    let factory = TcpSenderFactory::new(sender_config, Duration::from_secs(60));
    let pool = ResourcePool::with_parts(factory, &pool_config(max_size), Arc::clone(&catalog), Arc::clone(&metrics));
    (FanoutSender::new(pool, wait, catalog), metrics)
}
