// ABOUTME: Per-destination fault records and the aggregated fan-out failure report
//
// A fan-out call never fails atomically. Each failed destination becomes a
// FaultRecord; the records are returned together as a FailureReport whose kind
// is Partial when some destinations succeeded and Total when none did.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::peer::Peer;

// === Fault Cause ===

/// Why delivery to one destination failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FaultCause {
    /// No pooled sender could be obtained for the call
    #[error("{0}")]
    ResourceUnavailable(String),

    /// Connection to the peer could not be established
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Writing the frame failed
    #[error("Write failed: {0}")]
    Io(String),

    /// Connect or write exceeded the per-destination timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl FaultCause {
    /// Whether the failure might clear on its own (as opposed to a refused peer)
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ResourceUnavailable(_))
    }
}

// === Fault Record ===

/// A (peer, cause) pair produced when a send to one destination fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Destination that failed
    pub peer: Peer,
    /// What went wrong
    pub cause: FaultCause,
}

impl FaultRecord {
    /// Create a fault record
    pub const fn new(peer: Peer, cause: FaultCause) -> Self {
        Self { peer, cause }
    }
}

// === Failure Report ===

/// Whether some or all destinations of a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// At least one destination received the message
    Partial,
    /// No destination received the message
    Total,
}

/// Aggregated outcome of a fan-out call that produced at least one fault
#[derive(Debug, Clone, Error, Serialize)]
#[error("Delivery failed for {} of {} destinations", .faults.len(), .attempted)]
pub struct FailureReport {
    attempted: usize,
    faults: Vec<FaultRecord>,
}

impl FailureReport {
    /// Report for a call over `attempted` destinations
    pub fn new(attempted: usize, faults: Vec<FaultRecord>) -> Self {
        debug_assert!(faults.len() <= attempted);
        Self { attempted, faults }
    }

    /// Report marking every destination faulty with the same cause
    pub fn total(destinations: &[Peer], cause: &FaultCause) -> Self {
        let faults = destinations
            .iter()
            .map(|peer| FaultRecord::new(peer.clone(), cause.clone()))
            .collect();
        Self::new(destinations.len(), faults)
    }

    /// Partial or total
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        if self.faults.len() >= self.attempted {
            FailureKind::Total
        } else {
            FailureKind::Partial
        }
    }

    /// Whether every destination failed
    #[must_use]
    pub fn is_total(&self) -> bool {
        self.kind() == FailureKind::Total
    }

    /// The fault records, one per failed destination
    pub fn faults(&self) -> &[FaultRecord] {
        &self.faults
    }

    /// Consume the report into its records
    pub fn into_faults(self) -> Vec<FaultRecord> {
        self.faults
    }

    /// Peers that did not receive the message
    pub fn faulty_peers(&self) -> impl Iterator<Item = &Peer> {
        self.faults.iter().map(|f| &f.peer)
    }

    /// Number of destinations the call covered
    pub const fn attempted(&self) -> usize {
        self.attempted
    }
}
