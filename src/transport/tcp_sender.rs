// ABOUTME: TCP implementation of the multi-point sender used as the pooled resource
// ABOUTME: Keeps one lazily connected stream per peer and sends to all destinations concurrently

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::config::SenderConfig;
use super::error::{FaultCause, FaultRecord};
use super::frame::write_frame;
use super::peer::Peer;
use super::pool::{PooledResource, ResourceFactory};
use super::sender::MultiPointSend;

/// One connected peer
#[derive(Debug)]
struct Link {
    stream: TcpStream,
    last_write: Instant,
}

/// Pooled sender holding a TCP stream per peer it has talked to
#[derive(Debug)]
pub struct TcpMultiSender {
    links: HashMap<SocketAddr, Link>,
    config: SenderConfig,
    keepalive_interval: Duration,
    last_keepalive: Instant,
    closed: bool,
}

impl TcpMultiSender {
    /// Sender with no connections yet
    pub fn new(config: SenderConfig, keepalive_interval: Duration) -> Self {
        Self {
            links: HashMap::new(),
            config,
            keepalive_interval,
            last_keepalive: Instant::now(),
            closed: false,
        }
    }

    /// Number of peers with an open stream
    pub fn connected(&self) -> usize {
        self.links.len()
    }

    async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Link, FaultCause> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(FaultCause::Connect(e.to_string())),
            Err(_) => return Err(FaultCause::Timeout(timeout)),
        };
        // Frames are small and latency matters more than coalescing
        let _ = stream.set_nodelay(true);
        debug!(peer = %addr, "Connected to peer");
        Ok(Link {
            stream,
            last_write: Instant::now(),
        })
    }

    async fn deliver(
        peer: &Peer,
        link: Option<Link>,
        message: &[u8],
        config: &SenderConfig,
    ) -> Result<Link, FaultCause> {
        let mut link = match link {
            Some(link) => link,
            None => Self::connect(peer.addr, config.connect_timeout).await?,
        };

        match tokio::time::timeout(config.send_timeout, write_frame(&mut link.stream, message)).await {
            Ok(Ok(())) => {
                link.last_write = Instant::now();
                Ok(link)
            }
            Ok(Err(e)) => Err(FaultCause::Io(e.to_string())),
            Err(_) => Err(FaultCause::Timeout(config.send_timeout)),
        }
    }
}

#[async_trait]
impl PooledResource for TcpMultiSender {
    fn is_valid(&self) -> bool {
        !self.closed
    }

    /// Drop streams unused beyond the keepalive interval and probe the ones
    /// not written since the previous keepalive with an empty frame
    ///
    /// Fails only when every probe failed.
    async fn keepalive(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let previous = std::mem::replace(&mut self.last_keepalive, now);

        let interval = self.keepalive_interval;
        self.links.retain(|addr, link| {
            let keep = now.saturating_duration_since(link.last_write) <= interval;
            if !keep {
                debug!(peer = %addr, "Dropping idle peer stream");
            }
            keep
        });

        let stale: Vec<SocketAddr> = self
            .links
            .iter()
            .filter(|(_, link)| link.last_write < previous)
            .map(|(addr, _)| *addr)
            .collect();

        let mut failed = 0;
        for addr in &stale {
            let Some(link) = self.links.get_mut(addr) else {
                continue;
            };
            let probe = tokio::time::timeout(self.config.send_timeout, write_frame(&mut link.stream, &[])).await;
            if matches!(probe, Ok(Ok(()))) {
                trace!(peer = %addr, "Keepalive probe sent");
            } else {
                debug!(peer = %addr, "Keepalive probe failed, dropping stream");
                self.links.remove(addr);
                failed += 1;
            }
        }

        if !stale.is_empty() && failed == stale.len() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("all {failed} keepalive probes failed"),
            ));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        for (addr, mut link) in self.links.drain() {
            if let Err(e) = link.stream.shutdown().await {
                trace!(peer = %addr, error = %e, "Stream shutdown failed");
            }
        }
    }
}

#[async_trait]
impl MultiPointSend for TcpMultiSender {
    async fn send_to_peers(&mut self, destinations: &[Peer], message: &[u8]) -> Vec<FaultRecord> {
        let config = self.config.clone();
        let attempts = destinations.iter().map(|peer| {
            let link = self.links.remove(&peer.addr);
            let config = &config;
            async move { (peer, Self::deliver(peer, link, message, config).await) }
        });
        let outcomes = join_all(attempts.collect::<Vec<_>>()).await;

        let mut faults = Vec::new();
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(link) => {
                    self.links.insert(peer.addr, link);
                }
                Err(cause) => {
                    debug!(peer = %peer, cause = %cause, "Send to peer failed");
                    faults.push(FaultRecord::new(peer.clone(), cause));
                }
            }
        }
        faults
    }
}

// === Factory ===

/// Builds `TcpMultiSender`s for the resource pool
#[derive(Debug, Clone)]
pub struct TcpSenderFactory {
    config: SenderConfig,
    keepalive_interval: Duration,
}

impl TcpSenderFactory {
    pub const fn new(config: SenderConfig, keepalive_interval: Duration) -> Self {
        Self {
            config,
            keepalive_interval,
        }
    }
}

#[async_trait]
impl ResourceFactory for TcpSenderFactory {
    type Resource = TcpMultiSender;

    async fn create(&self) -> io::Result<TcpMultiSender> {
        Ok(TcpMultiSender::new(self.config.clone(), self.keepalive_interval))
    }
}
