// ABOUTME: Bounded-concurrency admission gate over a counting semaphore
// ABOUTME: Permits are RAII guards; denial carries a reason and a configurable status code

//! Admission gate.
//!
//! Protects a downstream operation from overload by granting at most
//! `capacity` concurrent permits. What happens at capacity depends on the
//! configured [`BlockingMode`]:
//!
//! | mode                  | `enter` at capacity                              |
//! |-----------------------|--------------------------------------------------|
//! | `RejectImmediately`   | denied at once                                   |
//! | `BlockUninterruptible`| waits; cancellation signals are ignored          |
//! | `BlockInterruptible`  | waits; cancellation denies without a permit      |
//!
//! A [`GatePermit`] releases its slot when dropped, so a permit is returned
//! exactly once per grant on every exit path.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use super::catalog::{Component, MessageCatalog};
use super::config::{BlockingMode, GateConfig};
use super::metrics::TransportMetrics;

// === Errors ===

/// Why a permit was not granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Every permit was in use and the mode does not wait
    AtCapacity,
    /// An interruptible wait was cancelled
    Cancelled,
    /// The gate was closed
    Closed,
}

/// Recoverable refusal to admit a caller
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AdmissionDenied {
    reason: DenialReason,
    message: String,
    status: Option<u16>,
}

impl AdmissionDenied {
    pub const fn reason(&self) -> DenialReason {
        self.reason
    }

    /// Overload status for HTTP-facing callers, if the gate was given one
    pub const fn status_code(&self) -> Option<u16> {
        self.status
    }
}

/// Invalid gate construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Gate capacity must be between 1 and {max}, got {capacity}")]
    InvalidCapacity { capacity: usize, max: usize },
}

// === Permit ===

/// One granted admission; dropping it leaves the gate
#[must_use = "dropping the permit leaves the gate immediately"]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Leave the gate, releasing the permit
    pub fn leave(self) {
        drop(self);
    }
}

impl fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePermit").finish_non_exhaustive()
    }
}

// === Gate ===

type ControlPredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Counting permit set shared by concurrent callers; clones share permits
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    fairness: bool,
    blocking_mode: BlockingMode,
    denied_status: Option<u16>,
    controls: Option<Arc<ControlPredicate>>,
    catalog: Arc<MessageCatalog>,
    metrics: Arc<TransportMetrics>,
}

impl AdmissionGate {
    /// Gate with the built-in catalog and private metrics
    pub fn new(config: &GateConfig) -> Result<Self, GateError> {
        Self::with_parts(
            config,
            MessageCatalog::builtin().shared(),
            Arc::new(TransportMetrics::new()),
        )
    }

    pub fn with_parts(
        config: &GateConfig,
        catalog: Arc<MessageCatalog>,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self, GateError> {
        if config.capacity == 0 || config.capacity > Semaphore::MAX_PERMITS {
            return Err(GateError::InvalidCapacity {
                capacity: config.capacity,
                max: Semaphore::MAX_PERMITS,
            });
        }

        // Waiters are served in arrival order regardless of `fairness`
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.capacity)),
            capacity: config.capacity,
            fairness: config.fairness,
            blocking_mode: config.blocking_mode,
            denied_status: config.denied_status_code,
            controls: None,
            catalog,
            metrics,
        })
    }

    /// Only keys for which `predicate` is true pass through the gate in `dispatch_for`
    #[must_use]
    pub fn with_controls(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.controls = Some(Arc::new(predicate));
        self
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn fairness(&self) -> bool {
        self.fairness
    }

    pub const fn blocking_mode(&self) -> BlockingMode {
        self.blocking_mode
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently granted
    pub fn outstanding(&self) -> usize {
        if self.semaphore.is_closed() {
            return 0;
        }
        self.capacity.saturating_sub(self.available())
    }

    /// Whether `key` is subject to admission control
    pub fn controls(&self, key: &str) -> bool {
        self.controls.as_ref().map_or(true, |predicate| predicate(key))
    }

    fn deny(&self, reason: DenialReason) -> AdmissionDenied {
        let message = match reason {
            DenialReason::AtCapacity => {
                self.catalog
                    .format(Component::Gate, "atCapacity", &[&self.capacity])
            }
            DenialReason::Cancelled => self.catalog.get(Component::Gate, "cancelled").to_string(),
            DenialReason::Closed => self.catalog.get(Component::Gate, "closed").to_string(),
        };
        TransportMetrics::incr(&self.metrics.gate_denied);
        debug!(reason = ?reason, "Admission denied");
        AdmissionDenied {
            reason,
            message,
            status: self.denied_status,
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        TransportMetrics::incr(&self.metrics.gate_granted);
        GatePermit { _permit: permit }
    }

    /// Take a permit without waiting
    pub fn try_enter(&self) -> Result<GatePermit, AdmissionDenied> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.grant(permit)),
            Err(TryAcquireError::NoPermits) => Err(self.deny(DenialReason::AtCapacity)),
            Err(TryAcquireError::Closed) => Err(self.deny(DenialReason::Closed)),
        }
    }

    /// Take a permit, waiting if the blocking mode allows
    pub async fn enter(&self) -> Result<GatePermit, AdmissionDenied> {
        if self.blocking_mode == BlockingMode::RejectImmediately {
            return self.try_enter();
        }
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Ok(self.grant(permit)),
            Err(_) => Err(self.deny(DenialReason::Closed)),
        }
    }

    /// Like `enter`, observing `cancel` while waiting in `BlockInterruptible` mode
    ///
    /// A cancelled wait is denied and consumes no permit. Other modes ignore
    /// `cancel`.
    pub async fn enter_cancellable<C>(&self, cancel: C) -> Result<GatePermit, AdmissionDenied>
    where
        C: Future<Output = ()>,
    {
        if self.blocking_mode != BlockingMode::BlockInterruptible {
            return self.enter().await;
        }

        tokio::select! {
            biased;
            acquired = Arc::clone(&self.semaphore).acquire_owned() => match acquired {
                Ok(permit) => Ok(self.grant(permit)),
                Err(_) => Err(self.deny(DenialReason::Closed)),
            },
            () = cancel => Err(self.deny(DenialReason::Cancelled)),
        }
    }

    /// Run `op` holding a permit, or `on_denied` exactly when no permit was granted
    pub async fn dispatch<T, Op, Fut, Denied>(&self, op: Op, on_denied: Denied) -> T
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        Denied: FnOnce(AdmissionDenied) -> T,
    {
        match self.enter().await {
            Ok(permit) => {
                let result = op().await;
                permit.leave();
                result
            }
            Err(denied) => on_denied(denied),
        }
    }

    /// `dispatch` for keys the control predicate selects; other keys run ungated
    pub async fn dispatch_for<T, Op, Fut, Denied>(&self, key: &str, op: Op, on_denied: Denied) -> T
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        Denied: FnOnce(AdmissionDenied) -> T,
    {
        if self.controls(key) {
            self.dispatch(op, on_denied).await
        } else {
            op().await
        }
    }

    /// Deny every current and future waiter; granted permits stay valid until dropped
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            info!(capacity = self.capacity, "Admission gate closed");
            self.semaphore.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("blocking_mode", &self.blocking_mode)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
