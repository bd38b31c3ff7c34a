// ABOUTME: Peer identity for cluster members addressed by fan-out sends
//
// A Peer pairs a stable identifier with the socket address it is reached on.
// Liveness metadata (last heartbeat, advertised load) rides along but never
// takes part in identity: two peers with the same id are the same member.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// === Peer ID ===

/// Stable identifier of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an opaque identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

// === Liveness ===

/// Transient liveness metadata attached to a peer by the membership feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    /// When the peer was last heard from
    pub last_seen: Option<DateTime<Utc>>,
    /// Idle workers the peer advertised
    pub ready: Option<u32>,
    /// Busy workers the peer advertised
    pub busy: Option<u32>,
}

// === Peer ===

/// Addressable cluster member eligible to receive a fan-out message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Stable identity
    pub id: PeerId,
    /// Where cluster frames are delivered
    pub addr: SocketAddr,
    /// Liveness metadata, excluded from equality
    #[serde(default)]
    pub liveness: Liveness,
}

impl Peer {
    /// Peer identified by its own address
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: PeerId::from(addr),
            addr,
            liveness: Liveness::default(),
        }
    }

    /// Peer with an explicit opaque identifier
    pub fn with_id(id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: PeerId::new(id),
            addr,
            liveness: Liveness::default(),
        }
    }

    /// Attach liveness metadata
    #[must_use]
    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.as_str() == self.addr.to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}@{}", self.id, self.addr)
        }
    }
}

/// Errors parsing a peer from `host:port` or `id@host:port`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerParseError {
    /// Address part did not resolve
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// Identifier part was empty
    #[error("Empty peer id in '{0}'")]
    EmptyId(String),
}

impl FromStr for Peer {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr_part) = match s.split_once('@') {
            Some((id, rest)) => {
                if id.is_empty() {
                    return Err(PeerParseError::EmptyId(s.to_string()));
                }
                (Some(id), rest)
            }
            None => (None, s),
        };

        let addr = addr_part
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| PeerParseError::InvalidAddress(addr_part.to_string()))?;

        Ok(match id {
            Some(id) => Self::with_id(id, addr),
            None => Self::new(addr),
        })
    }
}
