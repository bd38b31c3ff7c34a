// ABOUTME: Configuration sections for the cluster transport
//
// Defines the tunables for each component:
// - Pool sizing, acquisition wait and keepalive/reaper cadence
// - Per-destination connect and send timeouts for the TCP sender
// - Heartbeat rendezvous group, port, TTL and tick interval
// - Admission gate capacity, fairness, blocking mode and denial status

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::pool::Wait;

// === Pool ===

/// Resource pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum resources alive at once (lent + idle)
    pub max_size: usize,

    /// Milliseconds to wait in acquire: 0 fails fast, negative waits forever
    pub max_wait_millis: i64,

    /// Idle resources older than this are closed instead of handed out
    #[serde(with = "duration_millis", rename = "keepalive_interval_millis")]
    pub keepalive_interval: Duration,

    /// Cadence of the background reaper
    #[serde(with = "duration_millis", rename = "reaper_interval_millis")]
    pub reaper_interval: Duration,

    /// Whether the reaper runs at all
    pub reaper_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 25,
            max_wait_millis: 3000,
            keepalive_interval: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(15),
            reaper_enabled: true,
        }
    }
}

impl PoolConfig {
    /// Acquisition bound derived from `max_wait_millis`
    pub fn max_wait(&self) -> Wait {
        Wait::from_millis(self.max_wait_millis)
    }
}

// === Sender ===

/// Per-destination limits for the TCP multi-point sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Time allowed to establish a connection to one peer
    #[serde(with = "duration_millis", rename = "connect_timeout_millis")]
    pub connect_timeout: Duration,

    /// Time allowed to write one frame to one peer
    #[serde(with = "duration_millis", rename = "send_timeout_millis")]
    pub send_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(3),
        }
    }
}

// === Heartbeat ===

/// Multicast heartbeat configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Rendezvous group (multicast) or broadcast/unicast target address
    pub group_address: IpAddr,

    /// Destination port of announcements
    pub port: u16,

    /// Multicast time-to-live (hop count)
    pub ttl: u32,

    /// Local interface to bind and join on; wildcard when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_interface: Option<IpAddr>,

    /// Tick cadence of the heartbeat service
    #[serde(with = "duration_millis", rename = "interval_millis")]
    pub interval: Duration,

    /// Listener side: forget nodes silent for longer than this
    #[serde(with = "duration_millis", rename = "expiry_millis")]
    pub expiry: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            group_address: IpAddr::V4(Ipv4Addr::new(224, 0, 1, 105)),
            port: 23364,
            ttl: 16,
            local_interface: None,
            interval: Duration::from_secs(5),
            expiry: Duration::from_secs(15),
        }
    }
}

impl HeartbeatConfig {
    /// Address announcements are sent to
    pub const fn target(&self) -> SocketAddr {
        SocketAddr::new(self.group_address, self.port)
    }

    /// Whether the group address is a multicast group that must be joined
    pub const fn is_multicast(&self) -> bool {
        self.group_address.is_multicast()
    }
}

// === Admission Gate ===

/// What `enter` does when no permit is free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// Deny immediately
    RejectImmediately,
    /// Wait for a permit; cancellation is ignored
    #[default]
    BlockUninterruptible,
    /// Wait for a permit; cancellation denies without consuming one
    BlockInterruptible,
}

/// Admission gate configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum concurrently granted permits
    pub capacity: usize,

    /// FIFO ordering of waiters
    pub fairness: bool,

    /// Behaviour at capacity
    pub blocking_mode: BlockingMode,

    /// Status reported to HTTP-facing callers on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_status_code: Option<u16>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            fairness: false,
            blocking_mode: BlockingMode::default(),
            denied_status_code: None,
        }
    }
}

/// Serde helper for Duration as milliseconds (u64)
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
