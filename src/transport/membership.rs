// ABOUTME: Proxy-side heartbeat listener and the expiring membership view it maintains
// ABOUTME: Turns received announcements into the live Peer list that feeds the fan-out sender

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::announcement::Announcement;
use super::config::HeartbeatConfig;
use super::heartbeat::MAX_DATAGRAM_LEN;
use super::peer::{Liveness, Peer};

/// How often the receive loop rechecks the shutdown flag
const RECV_POLL: Duration = Duration::from_millis(200);

// === Membership ===

#[derive(Debug, Clone)]
struct Member {
    announcement: Announcement,
    seen_at: Instant,
    liveness: Liveness,
}

/// Nodes heard from recently, keyed by their advertised service address
#[derive(Debug, Clone)]
pub struct Membership {
    expiry: Duration,
    members: BTreeMap<SocketAddr, Member>,
}

impl Membership {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            members: BTreeMap::new(),
        }
    }

    /// Record an announcement received from `source`
    ///
    /// The member address is the source IP with the advertised port.
    /// Returns true when the node was not known before.
    pub fn record(&mut self, source: SocketAddr, announcement: Announcement, now: Instant) -> bool {
        let addr = SocketAddr::new(source.ip(), announcement.port);
        let liveness = Liveness {
            last_seen: Some(Utc::now()),
            ready: Some(announcement.ready),
            busy: Some(announcement.busy),
        };
        self.members
            .insert(
                addr,
                Member {
                    announcement,
                    seen_at: now,
                    liveness,
                },
            )
            .is_none()
    }

    /// Forget members silent longer than the expiry; returns the removed peers
    pub fn expire(&mut self, now: Instant) -> Vec<Peer> {
        let expiry = self.expiry;
        let expired: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.seen_at) > expiry)
            .map(|(addr, _)| *addr)
            .collect();

        expired
            .into_iter()
            .filter_map(|addr| {
                self.members
                    .remove(&addr)
                    .map(|m| Peer::new(addr).with_liveness(m.liveness))
            })
            .collect()
    }

    /// Live peers ordered by address
    pub fn peers(&self) -> Vec<Peer> {
        self.members
            .iter()
            .map(|(addr, m)| Peer::new(*addr).with_liveness(m.liveness.clone()))
            .collect()
    }

    /// Last announcement of a member
    pub fn announcement(&self, addr: &SocketAddr) -> Option<Announcement> {
        self.members.get(addr).map(|m| m.announcement)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// === Listener ===

/// Errors starting the heartbeat listener
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind heartbeat listener on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Heartbeat listener is already running")]
    AlreadyRunning,
}

/// Receives heartbeat datagrams and keeps a shared `Membership` current
pub struct HeartbeatListener {
    config: HeartbeatConfig,
    membership: Arc<RwLock<Membership>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatListener {
    pub fn new(config: HeartbeatConfig) -> Self {
        let membership = Arc::new(RwLock::new(Membership::new(config.expiry)));
        Self {
            config,
            membership,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Shared view updated by the receive loop
    pub fn membership(&self) -> Arc<RwLock<Membership>> {
        Arc::clone(&self.membership)
    }

    /// Expire silent members and return the live peers
    pub fn live_peers(&self) -> Vec<Peer> {
        let mut membership = self.membership.write().unwrap_or_else(PoisonError::into_inner);
        for peer in membership.expire(Instant::now()) {
            info!(peer = %peer, "Member expired");
        }
        membership.peers()
    }

    fn bind(config: &HeartbeatConfig) -> std::io::Result<std::net::UdpSocket> {
        let socket = match config.group_address {
            IpAddr::V4(group) => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_reuse_address(true)?;
                let interface = match config.local_interface {
                    Some(IpAddr::V4(addr)) => addr,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                if group.is_multicast() {
                    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port).into())?;
                    socket.join_multicast_v4(&group, &interface)?;
                } else {
                    socket.bind(&SocketAddr::new(IpAddr::V4(interface), config.port).into())?;
                }
                socket
            }
            IpAddr::V6(group) => {
                let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_reuse_address(true)?;
                socket.set_only_v6(true)?;
                let interface = match config.local_interface {
                    Some(IpAddr::V6(addr)) => addr,
                    _ => Ipv6Addr::UNSPECIFIED,
                };
                if group.is_multicast() {
                    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port).into())?;
                    socket.join_multicast_v6(&group, 0)?;
                } else {
                    socket.bind(&SocketAddr::new(IpAddr::V6(interface), config.port).into())?;
                }
                socket
            }
        };
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// Bind the rendezvous port and start receiving; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr, ListenerError> {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }

        let bind_failed = |source| ListenerError::BindFailed {
            port: self.config.port,
            source,
        };
        let socket = Self::bind(&self.config)
            .and_then(UdpSocket::from_std)
            .map_err(bind_failed)?;
        let local_addr = socket.local_addr().map_err(bind_failed)?;

        self.shutdown.store(false, Ordering::SeqCst);
        let membership = Arc::clone(&self.membership);
        let shutdown = Arc::clone(&self.shutdown);
        self.handle = Some(tokio::spawn(async move {
            Self::recv_loop(socket, membership, shutdown).await;
        }));

        info!(addr = %local_addr, group = %self.config.group_address, "Heartbeat listener started");
        Ok(local_addr)
    }

    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            info!("Heartbeat listener stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    async fn recv_loop(socket: UdpSocket, membership: Arc<RwLock<Membership>>, shutdown: Arc<AtomicBool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN * 2];

        while !shutdown.load(Ordering::SeqCst) {
            let (len, source) = match tokio::time::timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    debug!(error = %e, "Heartbeat receive error");
                    continue;
                }
                Err(_) => continue,
            };

            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                debug!(source = %source, "Ignoring non-text heartbeat");
                continue;
            };
            match text.parse::<Announcement>() {
                Ok(announcement) => {
                    trace!(source = %source, %announcement, "Heartbeat received");
                    let joined = membership
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(source, announcement, Instant::now());
                    if joined {
                        info!(
                            member = %SocketAddr::new(source.ip(), announcement.port),
                            "Member joined"
                        );
                    }
                }
                Err(e) => debug!(source = %source, error = %e, "Ignoring malformed heartbeat"),
            }
        }

        debug!("Heartbeat listener loop ended");
    }
}

impl Drop for HeartbeatListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
