// ABOUTME: Bounded pool of reusable transport resources with scoped acquisition
// ABOUTME: Lazily creates up to max_size resources, lends each to one caller at a time, reaps idle ones

//! Generic resource pool.
//!
//! `ResourcePool<F>` owns every resource produced by its [`ResourceFactory`].
//! A caller borrows one through [`ResourcePool::acquire`], which hands back a
//! [`Pooled`] guard. The guard is the only way to reach the resource and it
//! returns the resource to the pool when dropped, so release happens on every
//! exit path: normal return, `?` propagation, panic unwinding and future
//! cancellation.
//!
//! # Invariants
//!
//! - `lent + idle + retiring <= max_size` at every observation point
//! - an idle resource is owned by the pool; a lent one by exactly one guard
//! - resources found stale or invalid are closed, never handed out
//!
//! # Usage
//!
//! ```ignore
//! let pool = ResourcePool::new(factory, &PoolConfig::default());
//!
//! let mut sender = pool.acquire(Wait::Bounded(Duration::from_millis(50))).await?;
//! sender.keepalive().await?;
//! drop(sender); // back to the idle set
//!
//! pool.close().await;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{Component, MessageCatalog};
use super::config::PoolConfig;
use super::metrics::TransportMetrics;

// === Resource Traits ===

/// A reusable transport handle managed by the pool
#[async_trait]
pub trait PooledResource: Send + 'static {
    /// Whether the handle can still be used; invalid handles are destroyed on return
    fn is_valid(&self) -> bool;

    /// Lightweight liveness probe keeping transport-layer state from expiring
    async fn keepalive(&mut self) -> io::Result<()>;

    /// Tear down the underlying transport
    async fn close(&mut self);
}

/// Produces fresh resources when the pool has room to grow
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Resource type this factory builds
    type Resource: PooledResource;

    /// Build one resource
    async fn create(&self) -> io::Result<Self::Resource>;
}

// === Wait Bound ===

/// How long `acquire` may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail fast when nothing is available
    NoWait,
    /// Block up to the given duration
    Bounded(Duration),
    /// Block until a resource frees up or the pool closes
    Forever,
}

impl Wait {
    /// `0` fails fast, negative waits forever, positive waits that many ms
    pub const fn from_millis(millis: i64) -> Self {
        if millis == 0 {
            Self::NoWait
        } else if millis < 0 {
            Self::Forever
        } else {
            Self::Bounded(Duration::from_millis(millis.unsigned_abs()))
        }
    }

    fn as_millis(self) -> u128 {
        match self {
            Self::NoWait => 0,
            Self::Bounded(d) => d.as_millis(),
            Self::Forever => u128::MAX,
        }
    }
}

// === Resource ID ===

/// Unique identifier for a pooled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    /// Generate a new unique resource ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Pool Errors ===

/// Errors returned by `acquire`
#[derive(Debug, Error)]
pub enum PoolError {
    /// Nothing became available within the wait bound
    #[error("{message}")]
    Exhausted {
        /// Time spent waiting
        waited: Duration,
        /// Catalog message
        message: String,
    },

    /// Pool was closed before or while waiting
    #[error("{0}")]
    Closed(String),

    /// Pool had room but the factory failed
    #[error("{message}")]
    CreateFailed {
        /// Catalog message
        message: String,
        /// Factory error
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    /// Whether the caller got no resource because none could be lent
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Closed(_))
    }
}

// === Pool Status ===

/// Point-in-time view of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Resources waiting in the idle set
    pub idle: usize,
    /// Resources currently owned by callers
    pub lent: usize,
    /// Resources being closed
    pub retiring: usize,
    /// Configured capacity
    pub max_size: usize,
    /// Whether the pool has been closed
    pub closed: bool,
}

/// Outcome of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Idle resources closed for exceeding the keepalive interval or being invalid
    pub expired: usize,
    /// Idle resources probed successfully
    pub probed: usize,
    /// Idle resources invalidated because the probe failed
    pub failed: usize,
}

// === Internal State ===

struct Entry<R> {
    id: ResourceId,
    resource: R,
    last_activity: Instant,
}

struct PoolState<R> {
    /// Most recently used at the front
    idle: VecDeque<Entry<R>>,
    lent: usize,
    retiring: usize,
    closed: bool,
}

impl<R> PoolState<R> {
    fn total(&self) -> usize {
        self.idle.len() + self.lent + self.retiring
    }
}

enum Take<R> {
    Idle(Entry<R>),
    Create,
    Full,
    Closed,
}

struct Shared<F: ResourceFactory> {
    factory: F,
    max_size: usize,
    keepalive_interval: Duration,
    state: Mutex<PoolState<F::Resource>>,
    available: Notify,
    catalog: Arc<MessageCatalog>,
    metrics: Arc<TransportMetrics>,
    reaper_shutdown: Arc<AtomicBool>,
    reaper_wake: Arc<Notify>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ResourceFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, entry: &Entry<F::Resource>, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_activity) > self.keepalive_interval
    }

    /// Pop a usable idle entry, reserve a creation slot, or report why neither is possible.
    /// Stale and invalid idle entries found on the way are moved to retiring.
    fn try_take(&self) -> (Take<F::Resource>, Vec<Entry<F::Resource>>) {
        let mut state = self.lock();
        if state.closed {
            return (Take::Closed, Vec::new());
        }

        let now = Instant::now();
        let mut discarded = Vec::new();
        while let Some(entry) = state.idle.pop_front() {
            if self.is_stale(&entry, now) || !entry.resource.is_valid() {
                state.retiring += 1;
                discarded.push(entry);
                continue;
            }
            state.lent += 1;
            return (Take::Idle(entry), discarded);
        }

        if state.total() < self.max_size {
            state.lent += 1;
            (Take::Create, discarded)
        } else {
            (Take::Full, discarded)
        }
    }

    fn give_back(&self, mut entry: Entry<F::Resource>, touch: bool) -> Option<Entry<F::Resource>> {
        let mut state = self.lock();
        assert!(state.lent > 0, "resource pool released more resources than it lent");
        state.lent -= 1;

        let rejected = if state.closed || !entry.resource.is_valid() {
            state.retiring += 1;
            Some(entry)
        } else {
            if touch {
                entry.last_activity = Instant::now();
            }
            state.idle.push_front(entry);
            None
        };
        drop(state);

        self.available.notify_one();
        rejected
    }

    fn lent_to_retiring(&self) {
        let mut state = self.lock();
        assert!(state.lent > 0, "resource pool invalidated a resource it never lent");
        state.lent -= 1;
        state.retiring += 1;
    }

    fn forfeit_slot(&self) {
        let mut state = self.lock();
        assert!(state.lent > 0, "resource pool forfeited a slot it never reserved");
        state.lent -= 1;
        drop(state);
        self.available.notify_one();
    }

    fn retired(&self) {
        let mut state = self.lock();
        assert!(state.retiring > 0, "resource pool retired more resources than it closed");
        state.retiring -= 1;
        drop(state);
        TransportMetrics::incr(&self.metrics.resources_destroyed);
        self.available.notify_one();
    }
}

/// Close entries already counted as retiring, off the caller's task when possible
fn retire<F: ResourceFactory>(shared: &Arc<Shared<F>>, entries: Vec<Entry<F::Resource>>) -> Option<JoinHandle<()>> {
    if entries.is_empty() {
        return None;
    }

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let shared = Arc::clone(shared);
        Some(handle.spawn(async move {
            for mut entry in entries {
                debug!(resource = %entry.id, "Closing retired resource");
                entry.resource.close().await;
                shared.retired();
            }
        }))
    } else {
        // No runtime to run the async close on; dropping the handle closes the transport
        for entry in entries {
            drop(entry);
            shared.retired();
        }
        None
    }
}

// === Slot Reservation ===

/// Returns a reserved creation slot if `acquire` is cancelled while the factory runs
struct SlotReservation<'a, F: ResourceFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: ResourceFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forfeit_slot();
        }
    }
}

// === Pooled Guard ===

/// Exclusive loan of one resource; dropping it returns the resource to the pool
pub struct Pooled<F: ResourceFactory> {
    entry: Option<Entry<F::Resource>>,
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> Pooled<F> {
    fn entry(&self) -> &Entry<F::Resource> {
        self.entry.as_ref().expect("pooled resource used after release")
    }

    /// Identifier of the borrowed resource
    pub fn id(&self) -> ResourceId {
        self.entry().id
    }

    /// Return the resource to the idle set
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the resource instead of returning it, freeing its slot
    pub async fn invalidate(mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        debug!(resource = %entry.id, "Invalidating pooled resource");
        self.shared.lent_to_retiring();
        if let Some(handle) = retire(&self.shared, vec![entry]) {
            let _ = handle.await;
        }
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.entry().resource
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .entry
            .as_mut()
            .expect("pooled resource used after release")
            .resource
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(rejected) = self.shared.give_back(entry, true) {
                debug!(resource = %rejected.id, "Destroying resource returned invalid or after close");
                retire(&self.shared, vec![rejected]);
            }
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .finish()
    }
}

// === Resource Pool ===

/// Bounded pool of reusable resources; cheap to clone, clones share one pool
pub struct ResourcePool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("status", &self.status())
            .field("keepalive_interval", &self.shared.keepalive_interval)
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create an empty pool with the built-in message catalog
    pub fn new(factory: F, config: &PoolConfig) -> Self {
        Self::with_parts(
            factory,
            config,
            MessageCatalog::builtin().shared(),
            Arc::new(TransportMetrics::new()),
        )
    }

    /// Create an empty pool sharing a catalog and metrics with other components
    pub fn with_parts(
        factory: F,
        config: &PoolConfig,
        catalog: Arc<MessageCatalog>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        assert!(config.max_size > 0, "resource pool max_size must be positive");
        let pool = Self {
            shared: Arc::new(Shared {
                factory,
                max_size: config.max_size,
                keepalive_interval: config.keepalive_interval,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    lent: 0,
                    retiring: 0,
                    closed: false,
                }),
                available: Notify::new(),
                catalog,
                metrics,
                reaper_shutdown: Arc::new(AtomicBool::new(false)),
                reaper_wake: Arc::new(Notify::new()),
                reaper_handle: Mutex::new(None),
            }),
        };

        if config.reaper_enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                pool.start_reaper(config.reaper_interval);
            } else {
                debug!("No runtime, pool reaper not started");
            }
        }
        pool
    }

    /// Shared metrics handle
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.shared.metrics
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            idle: state.idle.len(),
            lent: state.lent,
            retiring: state.retiring,
            max_size: self.shared.max_size,
            closed: state.closed,
        }
    }

    /// Borrow a resource, waiting up to `wait` for one to become available
    ///
    /// # Errors
    ///
    /// - `Exhausted` if the pool stayed full for the whole wait
    /// - `Closed` if the pool is or becomes closed
    /// - `CreateFailed` if the pool had room but the factory failed
    pub async fn acquire(&self, wait: Wait) -> Result<Pooled<F>, PoolError> {
        let start = Instant::now();
        let deadline = match wait {
            Wait::Bounded(d) => Some(start + d),
            Wait::NoWait | Wait::Forever => None,
        };

        loop {
            // Register interest before inspecting state so a release in between is not missed
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (take, discarded) = self.shared.try_take();
            if !discarded.is_empty() {
                debug!(count = discarded.len(), "Discarding stale idle resources");
                retire(&self.shared, discarded);
            }

            match take {
                Take::Idle(entry) => {
                    TransportMetrics::incr(&self.shared.metrics.pool_acquired);
                    return Ok(self.guard(entry));
                }
                Take::Create => {
                    let entry = self.create_reserved().await?;
                    TransportMetrics::incr(&self.shared.metrics.pool_acquired);
                    return Ok(self.guard(entry));
                }
                Take::Closed => {
                    return Err(PoolError::Closed(
                        self.shared.catalog.get(Component::Pool, "closed").to_string(),
                    ));
                }
                Take::Full => {}
            }

            let timed_out = match (wait, deadline) {
                (Wait::Forever, _) => {
                    notified.await;
                    false
                }
                (Wait::Bounded(_), Some(deadline)) => {
                    tokio::time::timeout_at(deadline.into(), notified).await.is_err()
                }
                _ => true,
            };

            if timed_out {
                TransportMetrics::incr(&self.shared.metrics.pool_exhausted);
                let waited = start.elapsed();
                debug!(waited_ms = %waited.as_millis(), "Pool exhausted");
                return Err(PoolError::Exhausted {
                    waited,
                    message: self
                        .shared
                        .catalog
                        .format(Component::Pool, "exhausted", &[&wait.as_millis()]),
                });
            }
        }
    }

    /// Borrow a resource for the duration of `op`; it is returned however `op` ends
    pub async fn with_resource<T, Op>(&self, wait: Wait, op: Op) -> Result<T, PoolError>
    where
        Op: for<'r> FnOnce(&'r mut F::Resource) -> BoxFuture<'r, T>,
    {
        let mut guard = self.acquire(wait).await?;
        Ok(op(&mut guard).await)
    }

    /// Eagerly create up to `count` idle resources, bounded by free capacity
    ///
    /// Returns the number created.
    pub async fn prewarm(&self, count: usize) -> Result<usize, PoolError> {
        let mut created = 0;
        for _ in 0..count {
            {
                let mut state = self.shared.lock();
                if state.closed || state.total() >= self.shared.max_size {
                    break;
                }
                state.lent += 1;
            }
            let entry = self.create_reserved().await?;
            match self.shared.give_back(entry, true) {
                None => created += 1,
                Some(rejected) => {
                    // Invalid from birth or the pool closed meanwhile
                    if let Some(handle) = retire(&self.shared, vec![rejected]) {
                        let _ = handle.await;
                    }
                    break;
                }
            }
        }
        debug!(created, "Pool prewarmed");
        Ok(created)
    }

    async fn create_reserved(&self) -> Result<Entry<F::Resource>, PoolError> {
        let mut reservation = SlotReservation {
            shared: &self.shared,
            armed: true,
        };

        match self.shared.factory.create().await {
            Ok(resource) => {
                reservation.armed = false;
                TransportMetrics::incr(&self.shared.metrics.resources_created);
                let entry = Entry {
                    id: ResourceId::new(),
                    resource,
                    last_activity: Instant::now(),
                };
                debug!(resource = %entry.id, "Created pooled resource");
                Ok(entry)
            }
            Err(source) => {
                drop(reservation);
                warn!(error = %source, "Failed to create pooled resource");
                Err(PoolError::CreateFailed {
                    message: self
                        .shared
                        .catalog
                        .format(Component::Pool, "createFailed", &[&source]),
                    source,
                })
            }
        }
    }

    fn guard(&self, entry: Entry<F::Resource>) -> Pooled<F> {
        Pooled {
            entry: Some(entry),
            shared: Arc::clone(&self.shared),
        }
    }

    /// One reaper pass: close idle resources past the keepalive interval, probe the rest
    pub async fn reap_idle(&self) -> ReapSummary {
        let now = Instant::now();
        let (expired, fresh) = {
            let mut state = self.shared.lock();
            if state.closed {
                return ReapSummary::default();
            }
            let (expired, fresh): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|e| self.shared.is_stale(e, now) || !e.resource.is_valid());
            state.retiring += expired.len();
            // The reaper borrows the fresh entries while probing them
            state.lent += fresh.len();
            (expired, fresh)
        };

        let mut summary = ReapSummary {
            expired: expired.len(),
            ..ReapSummary::default()
        };
        if let Some(handle) = retire(&self.shared, expired) {
            let _ = handle.await;
        }

        for mut entry in fresh {
            match entry.resource.keepalive().await {
                Ok(()) => {
                    summary.probed += 1;
                    if let Some(rejected) = self.shared.give_back(entry, false) {
                        retire(&self.shared, vec![rejected]);
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        resource = %entry.id,
                        error = %e,
                        "{}",
                        self.shared.catalog.format(Component::Pool, "probeFailed", &[&entry.id, &e])
                    );
                    self.shared.lent_to_retiring();
                    if let Some(handle) = retire(&self.shared, vec![entry]) {
                        let _ = handle.await;
                    }
                }
            }
        }

        if summary != ReapSummary::default() {
            debug!(
                expired = summary.expired,
                probed = summary.probed,
                failed = summary.failed,
                "Reaper pass complete"
            );
        }
        summary
    }

    /// Start the background reaper running one pass every `interval`
    pub fn start_reaper(&self, interval: Duration) {
        let mut handle_slot = self
            .shared
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle_slot.is_some() {
            return;
        }

        self.shared.reaper_shutdown.store(false, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.shared);
        let shutdown = Arc::clone(&self.shared.reaper_shutdown);
        let wake = Arc::clone(&self.shared.reaper_wake);

        *handle_slot = Some(tokio::spawn(async move {
            Self::reaper_loop(weak, interval, shutdown, wake).await;
        }));
        info!(interval_ms = %interval.as_millis(), "Pool reaper started");
    }

    /// Stop the background reaper and wait for its current pass to finish
    pub async fn stop_reaper(&self) {
        self.shared.reaper_shutdown.store(true, Ordering::SeqCst);
        self.shared.reaper_wake.notify_one();

        let handle = self
            .shared
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            info!("Pool reaper stopped");
        }
    }

    /// Whether the background reaper is running
    pub fn is_reaper_running(&self) -> bool {
        self.shared
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            && !self.shared.reaper_shutdown.load(Ordering::SeqCst)
    }

    async fn reaper_loop(
        shared: Weak<Shared<F>>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        while !shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                () = wake.notified() => continue,
            }

            let Some(shared) = shared.upgrade() else {
                break;
            };
            ResourcePool { shared }.reap_idle().await;
        }

        debug!("Reaper loop ended");
    }

    /// Close the pool: destroy idle resources, fail current and future waiters
    ///
    /// Resources still lent are destroyed when their guards drop.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.retiring += drained.len();
            drained
        };

        self.shared.available.notify_waiters();
        info!(idle_closed = drained.len(), "Closing resource pool");

        self.stop_reaper().await;
        if let Some(handle) = retire(&self.shared, drained) {
            let _ = handle.await;
        }
    }
}
