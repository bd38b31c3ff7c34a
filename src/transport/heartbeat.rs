// ABOUTME: Multicast heartbeat broadcaster with a lazily reopened socket and its periodic driver
// ABOUTME: Explicit state machine UNINITIALIZED -> READY <-> FAILED -> CLOSED, failure code -1

//! Heartbeat broadcaster.
//!
//! Announces this node's liveness and load to a multicast (or broadcast)
//! rendezvous. Front-end proxies listen on the group and keep their own
//! expiry, so delivery is best effort: no acknowledgement, no retry.
//!
//! # State Machine
//!
//! ```text
//!   init()          send() ok
//! UNINITIALIZED ──▶ READY ◀───────┐
//!                    │   send()   │
//!                    │   failed   │ send() reopens
//!                    ▼            │
//!                  FAILED ────────┘
//!                    │
//!          close()   ▼
//!                  CLOSED
//! ```
//!
//! The socket is opened on the first `send` after `init` and discarded on any
//! open or transmit failure; the next `send` opens a fresh one.
//!
//! # Usage
//!
//! ```ignore
//! let mut broadcaster = HeartbeatBroadcaster::multicast(catalog, metrics);
//! broadcaster.init(config.heartbeat.clone());
//!
//! let mut service = HeartbeatService::new(config.heartbeat.interval);
//! service.start(broadcaster, || Announcement::new(ready(), busy(), 8009));
//! // ...
//! service.stop().await;
//! ```

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::announcement::Announcement;
use super::catalog::{Component, MessageCatalog};
use super::config::HeartbeatConfig;
use super::metrics::TransportMetrics;

/// Largest payload that fits one unfragmented datagram on any IPv4 path
pub const MAX_DATAGRAM_LEN: usize = 508;

// === Transport Seams ===

/// A connectionless socket able to send one datagram
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send `payload` to `target` as one datagram
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        Self::send_to(self, payload, target).await
    }
}

/// Opens the heartbeat socket for a configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, config: &HeartbeatConfig) -> io::Result<Box<dyn DatagramTransport>>;
}

/// Opens a UDP socket, joining the group when the target is multicast
#[derive(Debug, Clone, Copy, Default)]
pub struct MulticastOpener;

impl MulticastOpener {
    fn build(config: &HeartbeatConfig) -> io::Result<std::net::UdpSocket> {
        let socket = match config.group_address {
            IpAddr::V4(group) => {
                let interface = match config.local_interface {
                    Some(IpAddr::V4(addr)) => addr,
                    Some(IpAddr::V6(addr)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("IPv6 interface {addr} for IPv4 group {group}"),
                        ))
                    }
                    None => Ipv4Addr::UNSPECIFIED,
                };

                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_reuse_address(true)?;
                socket.bind(&SocketAddr::new(IpAddr::V4(interface), 0).into())?;
                if group.is_multicast() {
                    socket.set_multicast_ttl_v4(config.ttl)?;
                    socket.set_multicast_loop_v4(true)?;
                    if !interface.is_unspecified() {
                        socket.set_multicast_if_v4(&interface)?;
                    }
                    socket.join_multicast_v4(&group, &interface)?;
                } else {
                    socket.set_ttl(config.ttl)?;
                    socket.set_broadcast(true)?;
                }
                socket
            }
            IpAddr::V6(group) => {
                let interface = match config.local_interface {
                    Some(IpAddr::V6(addr)) => addr,
                    Some(IpAddr::V4(addr)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("IPv4 interface {addr} for IPv6 group {group}"),
                        ))
                    }
                    None => Ipv6Addr::UNSPECIFIED,
                };

                let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_reuse_address(true)?;
                socket.bind(&SocketAddr::new(IpAddr::V6(interface), 0).into())?;
                if group.is_multicast() {
                    socket.set_multicast_hops_v6(config.ttl)?;
                    socket.set_multicast_loop_v6(true)?;
                    socket.join_multicast_v6(&group, 0)?;
                } else {
                    socket.set_unicast_hops_v6(config.ttl)?;
                }
                socket
            }
        };

        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}

#[async_trait]
impl TransportOpener for MulticastOpener {
    async fn open(&self, config: &HeartbeatConfig) -> io::Result<Box<dyn DatagramTransport>> {
        let socket = UdpSocket::from_std(Self::build(config)?)?;
        debug!(
            group = %config.group_address,
            local = ?socket.local_addr().ok(),
            ttl = config.ttl,
            "Heartbeat socket opened"
        );
        Ok(Box::new(socket))
    }
}

// === State & Errors ===

/// Lifecycle of the broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No configuration yet
    Uninitialized,
    /// Configured; socket open or to be opened on the next send
    Ready,
    /// Last open or transmit failed; socket discarded
    Failed,
    /// Closed for good
    Closed,
}

impl fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Failures of a single heartbeat send
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("{0}")]
    NotInitialized(String),

    #[error("{0}")]
    Closed(String),

    #[error("{message}")]
    OpenFailed {
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("{message}")]
    SendFailed {
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("Heartbeat payload must be ASCII")]
    NotAscii,

    #[error("Heartbeat payload of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },
}

impl HeartbeatError {
    /// Numeric failure code reported to schedulers
    pub const fn code(&self) -> i32 {
        -1
    }
}

// === Broadcaster ===

/// Single-owner heartbeat sender
pub struct HeartbeatBroadcaster<O: TransportOpener = MulticastOpener> {
    opener: O,
    config: Option<HeartbeatConfig>,
    transport: Option<Box<dyn DatagramTransport>>,
    state: HeartbeatState,
    catalog: Arc<MessageCatalog>,
    metrics: Arc<TransportMetrics>,
}

impl HeartbeatBroadcaster<MulticastOpener> {
    /// Broadcaster using real UDP sockets
    pub fn multicast(catalog: Arc<MessageCatalog>, metrics: Arc<TransportMetrics>) -> Self {
        Self::new(MulticastOpener, catalog, metrics)
    }
}

impl<O: TransportOpener> HeartbeatBroadcaster<O> {
    pub fn new(opener: O, catalog: Arc<MessageCatalog>, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            opener,
            config: None,
            transport: None,
            state: HeartbeatState::Uninitialized,
            catalog,
            metrics,
        }
    }

    /// Store the rendezvous configuration; the socket is opened lazily
    pub fn init(&mut self, config: HeartbeatConfig) {
        assert!(
            self.state != HeartbeatState::Closed,
            "heartbeat broadcaster initialized after close"
        );
        info!(target = %config.target(), ttl = config.ttl, "Heartbeat broadcaster initialized");
        self.config = Some(config);
        self.transport = None;
        self.state = HeartbeatState::Ready;
    }

    pub const fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Whether a socket is currently held
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Send one ASCII datagram to the configured target
    ///
    /// Opens the socket if none is held. Any open or transmit failure is
    /// logged, discards the socket and moves to `Failed`; the next call
    /// reopens. Payload validation failures leave the state unchanged.
    pub async fn send(&mut self, message: &str) -> Result<usize, HeartbeatError> {
        let target = match (self.state, &self.config) {
            (HeartbeatState::Closed, _) => {
                return Err(HeartbeatError::Closed(
                    self.catalog.get(Component::Heartbeat, "closed").to_string(),
                ))
            }
            (HeartbeatState::Uninitialized, _) | (_, None) => {
                return Err(HeartbeatError::NotInitialized(
                    self.catalog
                        .get(Component::Heartbeat, "notInitialized")
                        .to_string(),
                ))
            }
            (_, Some(config)) => config.target(),
        };

        if !message.is_ascii() {
            return Err(HeartbeatError::NotAscii);
        }
        if message.len() > MAX_DATAGRAM_LEN {
            return Err(HeartbeatError::TooLarge {
                len: message.len(),
                max: MAX_DATAGRAM_LEN,
            });
        }

        if self.transport.is_none() {
            self.open().await?;
        }
        let Some(transport) = self.transport.as_ref() else {
            return Err(HeartbeatError::NotInitialized(
                self.catalog
                    .get(Component::Heartbeat, "notInitialized")
                    .to_string(),
            ));
        };

        match transport.send_to(message.as_bytes(), target).await {
            Ok(sent) => {
                trace!(target = %target, bytes = sent, "Heartbeat sent");
                self.state = HeartbeatState::Ready;
                TransportMetrics::incr(&self.metrics.heartbeats_sent);
                Ok(sent)
            }
            Err(source) => {
                let message = self
                    .catalog
                    .format(Component::Heartbeat, "sendFailed", &[&target]);
                warn!(target = %target, error = %source, "{}", message);
                self.transport = None;
                self.state = HeartbeatState::Failed;
                TransportMetrics::incr(&self.metrics.heartbeats_failed);
                Err(HeartbeatError::SendFailed { message, source })
            }
        }
    }

    /// Encode and send a load announcement
    pub async fn broadcast_heartbeat(&mut self, announcement: &Announcement) -> Result<(), HeartbeatError> {
        self.send(&announcement.encode()).await.map(|_| ())
    }

    async fn open(&mut self) -> Result<(), HeartbeatError> {
        let Some(config) = self.config.as_ref() else {
            return Err(HeartbeatError::NotInitialized(
                self.catalog
                    .get(Component::Heartbeat, "notInitialized")
                    .to_string(),
            ));
        };

        let reopening = self.state == HeartbeatState::Failed;
        match self.opener.open(config).await {
            Ok(transport) => {
                if reopening {
                    TransportMetrics::incr(&self.metrics.heartbeat_reopens);
                    info!(group = %config.group_address, "Heartbeat socket reopened");
                }
                self.transport = Some(transport);
                Ok(())
            }
            Err(source) => {
                let message = self.catalog.format(
                    Component::Heartbeat,
                    "openFailed",
                    &[&config.group_address],
                );
                warn!(group = %config.group_address, error = %source, "{}", message);
                self.state = HeartbeatState::Failed;
                TransportMetrics::incr(&self.metrics.heartbeats_failed);
                Err(HeartbeatError::OpenFailed { message, source })
            }
        }
    }

    /// Drop the socket and refuse further sends
    pub fn close(&mut self) {
        if self.state != HeartbeatState::Closed {
            debug!(previous = %self.state, "Heartbeat broadcaster closed");
        }
        self.transport = None;
        self.state = HeartbeatState::Closed;
    }
}

impl<O: TransportOpener> fmt::Debug for HeartbeatBroadcaster<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatBroadcaster")
            .field("state", &self.state)
            .field("target", &self.config.as_ref().map(HeartbeatConfig::target))
            .field("open", &self.is_open())
            .finish()
    }
}

// === Service ===

/// Supplies the announcement sent on each tick
pub trait LoadSource: Send + Sync + 'static {
    fn announcement(&self) -> Announcement;
}

impl<F> LoadSource for F
where
    F: Fn() -> Announcement + Send + Sync + 'static,
{
    fn announcement(&self) -> Announcement {
        self()
    }
}

/// Periodic driver sending one heartbeat per tick
pub struct HeartbeatService {
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Take ownership of `broadcaster` and start ticking
    pub fn start<O, L>(&mut self, broadcaster: HeartbeatBroadcaster<O>, load: L)
    where
        O: TransportOpener + 'static,
        L: LoadSource,
    {
        if self.is_running() {
            warn!("Heartbeat service already running");
            return;
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            Self::tick_loop(broadcaster, load, interval, shutdown, wake).await;
        }));
        info!(interval_ms = %interval.as_millis(), "Heartbeat service started");
    }

    /// Stop ticking and close the broadcaster
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            info!("Heartbeat service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    async fn tick_loop<O, L>(
        mut broadcaster: HeartbeatBroadcaster<O>,
        load: L,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) where
        O: TransportOpener,
        L: LoadSource,
    {
        debug!("Heartbeat loop started");

        while !shutdown.load(Ordering::SeqCst) {
            let announcement = load.announcement();
            if let Err(e) = broadcaster.broadcast_heartbeat(&announcement).await {
                // Already logged by the broadcaster; the next tick retries
                debug!(code = e.code(), state = %broadcaster.state(), "Heartbeat tick failed");
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = wake.notified() => {}
            }
        }

        broadcaster.close();
        debug!("Heartbeat loop ended");
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}
