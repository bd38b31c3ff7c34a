// ABOUTME: Fan-out sender delivering one message to many peers through a pooled resource
// ABOUTME: Aggregates per-destination failures into a FailureReport instead of failing atomically

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::catalog::{Component, MessageCatalog};
use super::error::{FailureReport, FaultCause, FaultRecord};
use super::metrics::TransportMetrics;
use super::peer::Peer;
use super::pool::{PoolError, PooledResource, ResourceFactory, ResourcePool, Wait};

// === Capability Trait ===

/// A pooled resource able to send one message to several peers
#[async_trait]
pub trait MultiPointSend: PooledResource {
    /// Attempt delivery to every destination independently
    ///
    /// Returns one fault record per destination that did not receive the
    /// message; an empty vector means every destination succeeded.
    async fn send_to_peers(&mut self, destinations: &[Peer], message: &[u8]) -> Vec<FaultRecord>;
}

// === Retry Policy ===

/// Decides which failed destinations get another attempt within the same call
pub trait RetryPolicy: Send + Sync + 'static {
    /// Whether `fault` should be retried after `attempts` attempts so far
    fn should_retry(&self, fault: &FaultRecord, attempts: u32) -> bool;
}

/// Every destination is attempted exactly once
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _fault: &FaultRecord, _attempts: u32) -> bool {
        false
    }
}

/// Retry transient faults (timeouts) up to `max_attempts` total attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryTransient {
    pub max_attempts: u32,
}

impl Default for RetryTransient {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy for RetryTransient {
    fn should_retry(&self, fault: &FaultRecord, attempts: u32) -> bool {
        attempts < self.max_attempts && fault.cause.is_transient()
    }
}

// === Fan-out Sender ===

/// Broadcasts messages to peer members using senders borrowed from a pool
pub struct FanoutSender<F>
where
    F: ResourceFactory,
    F::Resource: MultiPointSend,
{
    pool: ResourcePool<F>,
    max_wait: Wait,
    retry: Arc<dyn RetryPolicy>,
    catalog: Arc<MessageCatalog>,
    metrics: Arc<TransportMetrics>,
}

impl<F> FanoutSender<F>
where
    F: ResourceFactory,
    F::Resource: MultiPointSend,
{
    /// Sender over `pool` waiting at most `max_wait` for a pooled resource
    pub fn new(pool: ResourcePool<F>, max_wait: Wait, catalog: Arc<MessageCatalog>) -> Self {
        let metrics = Arc::clone(pool.metrics());
        Self {
            pool,
            max_wait,
            retry: Arc::new(NoRetry),
            catalog,
            metrics,
        }
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// The underlying pool
    pub const fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    /// Deliver `message` to every destination as one logical operation
    ///
    /// Each destination is attempted once (plus any retries the policy asks
    /// for). If no pooled sender can be obtained within the wait bound, every
    /// destination is reported faulty with a resource-unavailable cause and
    /// nothing is sent.
    pub async fn send_to_all(&self, destinations: &[Peer], message: &[u8]) -> Result<(), FailureReport> {
        if destinations.is_empty() {
            return Ok(());
        }
        TransportMetrics::incr(&self.metrics.fanout_calls);

        let mut sender = match self.pool.acquire(self.max_wait).await {
            Ok(sender) => sender,
            Err(e) => {
                // Only a timed-out wait has a meaningful bound to report
                let detail = match (&e, self.max_wait) {
                    (PoolError::Exhausted { .. }, Wait::Bounded(d)) => {
                        self.catalog
                            .format(Component::Fanout, "resourceUnavailable", &[&d.as_millis()])
                    }
                    (PoolError::Exhausted { .. }, Wait::NoWait) => {
                        self.catalog.format(Component::Fanout, "resourceUnavailable", &[&0])
                    }
                    _ => self.catalog.format(Component::Fanout, "retrieveFailed", &[&e]),
                };
                warn!(destinations = destinations.len(), error = %e, "{}", detail);

                let report = FailureReport::total(destinations, &FaultCause::ResourceUnavailable(detail));
                self.record_failure(&report);
                return Err(report);
            }
        };

        let mut faults = sender.send_to_peers(destinations, message).await;
        let mut attempts = 1;
        loop {
            let (again, settled): (Vec<_>, Vec<_>) = faults
                .into_iter()
                .partition(|fault| self.retry.should_retry(fault, attempts));
            faults = settled;
            if again.is_empty() {
                break;
            }

            let peers: Vec<Peer> = again.into_iter().map(|fault| fault.peer).collect();
            debug!(count = peers.len(), attempt = attempts + 1, "Retrying failed destinations");
            faults.extend(sender.send_to_peers(&peers, message).await);
            attempts += 1;
        }

        if let Err(e) = sender.keepalive().await {
            debug!(
                "{}",
                self.catalog.format(Component::Fanout, "keepaliveFailed", &[&e])
            );
        }
        drop(sender);

        if faults.is_empty() {
            return Ok(());
        }

        for fault in &faults {
            debug!(peer = %fault.peer, cause = %fault.cause, "Destination failed");
        }
        let report = FailureReport::new(destinations.len(), faults);
        self.record_failure(&report);
        Err(report)
    }

    fn record_failure(&self, report: &FailureReport) {
        TransportMetrics::add(&self.metrics.fault_records, report.faults().len());
        if report.is_total() {
            TransportMetrics::incr(&self.metrics.fanout_total_failures);
        } else {
            TransportMetrics::incr(&self.metrics.fanout_partial_failures);
        }
    }
}

impl<F> std::fmt::Debug for FanoutSender<F>
where
    F: ResourceFactory,
    F::Resource: MultiPointSend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSender")
            .field("pool", &self.pool)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}
