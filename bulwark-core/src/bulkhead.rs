//! Bulkhead pattern implementation.
//!
//! The bulkhead pattern isolates dependencies by bounding how many calls may
//! use each of them at once, so one slow dependency cannot exhaust shared
//! capacity.
//!
//! A bulkhead owns a fixed set of resource slots. [`Bulkhead::checkout`]
//! hands out a [`Lease`] on a free slot, queues the caller in strict FIFO
//! order while the pool is busy, and rejects immediately once the queue is
//! full as well. A lease that is dropped without [`Bulkhead::checkin`] (the
//! holder panicked, its task was aborted, or its future was cancelled) is
//! reclaimed automatically.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{Bulkhead, BulkheadConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let bulkhead = Bulkhead::start(
//!     BulkheadConfig::new("llm-provider")
//!         .max_concurrent(2)
//!         .max_waiting(4),
//! );
//!
//! let answer = bulkhead
//!     .with_resource(
//!         |resource| async move { Ok::<_, String>(resource.slot) },
//!         Duration::from_secs(1),
//!     )
//!     .await
//!     .unwrap();
//! assert!(answer < 2);
//!
//! let state = bulkhead.get_state().await.unwrap();
//! assert_eq!(state.available, 2);
//! # });
//! ```

use crate::error::{ResilienceError, Result};
use crate::failure::{capture, Failure};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Deadline used when `now + timeout` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Name of the bulkhead (for logging/metrics).
    pub name: String,
    /// Size of the resource pool.
    pub max_concurrent: usize,
    /// Maximum number of callers allowed to queue for a slot.
    pub max_waiting: usize,
    /// Default time a caller waits in the queue.
    pub checkout_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            max_waiting: 10,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the pool size.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the queue capacity.
    pub fn max_waiting(mut self, max: usize) -> Self {
        self.max_waiting = max;
        self
    }

    /// Set the default checkout timeout.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }
}

/// Identity of a checked out slot. Carries no business state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Resource {
    /// Index of the slot in the pool.
    pub slot: usize,
    /// Monotonic checkout sequence number.
    pub sequence: u64,
}

/// Ownership of a bulkhead slot.
///
/// Hand it back with [`Bulkhead::checkin`]. Dropping it instead releases the
/// slot as well, and the release is counted as a reclamation.
#[must_use = "dropping a lease releases its slot immediately"]
pub struct Lease {
    resource: Resource,
    bulkhead: Arc<str>,
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Lease {
    /// The leased resource.
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Name of the bulkhead the lease belongs to.
    pub fn bulkhead(&self) -> &str {
        &self.bulkhead
    }

    fn release(&mut self, reason: ReleaseReason) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Command::Release {
                resource: self.resource,
                reason,
            });
        }
    }

    // The slot was never recorded as busy.
    fn disarm(&mut self) {
        self.tx = None;
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("bulkhead", &self.bulkhead)
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release(ReleaseReason::Abandoned);
    }
}

/// Pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadState {
    pub name: String,
    pub available: usize,
    pub busy: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_waiting: usize,
}

/// Bulkhead counters.
///
/// Peaks are monotonic until the next [`Bulkhead::reset_metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    /// Checkout requests received.
    pub total_checkouts: u64,
    /// Checkouts that obtained a slot, immediately or after queueing.
    pub successful_checkouts: u64,
    /// Checkouts rejected because the pool and the queue were full.
    pub rejected_checkouts: u64,
    /// Queued checkouts whose deadline elapsed.
    pub timeouts: u64,
    /// Slots released by a dropped lease rather than a checkin.
    pub reclaimed: u64,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub queue_size: usize,
    pub peak_queue_size: usize,
}

impl BulkheadMetrics {
    /// Calculate rejection rate (0.0 - 1.0).
    pub fn rejection_rate(&self) -> f64 {
        if self.total_checkouts == 0 {
            0.0
        } else {
            self.rejected_checkouts as f64 / self.total_checkouts as f64
        }
    }
}

/// State and metrics captured together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadSnapshot {
    #[serde(flatten)]
    pub state: BulkheadState,
    pub metrics: BulkheadMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseReason {
    Checkin,
    Abandoned,
}

enum Command {
    Checkout {
        // `None` means fail instead of queueing.
        deadline: Option<Instant>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Lease>>,
    },
    Release {
        resource: Resource,
        reason: ReleaseReason,
    },
    Snapshot {
        reply: oneshot::Sender<BulkheadSnapshot>,
    },
    ResetMetrics {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running bulkhead.
#[derive(Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    checkout_timeout: Duration,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead").field("name", &self.name).finish()
    }
}

impl Bulkhead {
    /// Spawn the owning task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: BulkheadConfig) -> Self {
        info!(
            name = %config.name,
            max_concurrent = config.max_concurrent,
            max_waiting = config.max_waiting,
            "Bulkhead initialized"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(config.name.as_str());
        let checkout_timeout = config.checkout_timeout;
        tokio::spawn(BulkheadActor::new(config, name.clone(), tx.downgrade(), rx).run());

        Self {
            name,
            checkout_timeout,
            tx,
        }
    }

    /// Get the bulkhead name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured default checkout timeout.
    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// Lease a slot, queueing for at most `timeout` if none is free.
    pub async fn checkout(&self, timeout: Duration) -> Result<Lease> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        self.request_lease(Some(deadline), timeout).await
    }

    /// Lease a slot only if one is free right now.
    pub async fn try_checkout(&self) -> Result<Lease> {
        self.request_lease(None, Duration::ZERO).await
    }

    /// Return a leased slot to the pool.
    pub fn checkin(&self, mut lease: Lease) {
        if lease.bulkhead != self.name {
            warn!(
                name = %self.name,
                owner = %lease.bulkhead,
                "Lease checked in to a different bulkhead, releasing to its owner"
            );
        }
        lease.release(ReleaseReason::Checkin);
    }

    /// Run `operation` on a leased slot. The slot is returned on every exit
    /// path, including panics inside `operation` and cancellation.
    pub async fn with_resource<F, Fut, T, E>(&self, operation: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce(Resource) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
    {
        let lease = self.checkout(timeout).await?;
        let resource = lease.resource();

        let result = capture(async move { operation(resource).await }).await;
        self.checkin(lease);

        result.map_err(ResilienceError::Operation)
    }

    /// Read pool occupancy.
    pub async fn get_state(&self) -> Result<BulkheadState> {
        Ok(self.snapshot().await?.state)
    }

    /// Read counters.
    pub async fn get_metrics(&self) -> Result<BulkheadMetrics> {
        Ok(self.snapshot().await?.metrics)
    }

    /// Read state and counters in one consistent view.
    pub async fn snapshot(&self) -> Result<BulkheadSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Zero the counters and restart peak tracking from current usage.
    pub async fn reset_metrics(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ResetMetrics { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    async fn request_lease(&self, deadline: Option<Instant>, timeout: Duration) -> Result<Lease> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Checkout {
            deadline,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> ResilienceError {
        ResilienceError::Unavailable(self.name.to_string())
    }
}

struct Waiter {
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<Lease>>,
}

struct BulkheadActor {
    config: BulkheadConfig,
    name: Arc<str>,
    // Weak so that the task stops once every handle and lease is gone.
    self_tx: mpsc::WeakUnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    available: VecDeque<usize>,
    busy: HashMap<usize, u64>,
    waiting: VecDeque<Waiter>,
    sequence: u64,
    metrics: BulkheadMetrics,
}

impl BulkheadActor {
    fn new(
        config: BulkheadConfig,
        name: Arc<str>,
        self_tx: mpsc::WeakUnboundedSender<Command>,
        rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let available = (0..config.max_concurrent).collect();
        Self {
            config,
            name,
            self_tx,
            rx,
            available,
            busy: HashMap::new(),
            waiting: VecDeque::new(),
            sequence: 0,
            metrics: BulkheadMetrics::default(),
        }
    }

    async fn run(mut self) {
        loop {
            let next_deadline = self.waiting.iter().map(|w| w.deadline).min();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.expire_waiters();
                }
            }
        }

        debug!(name = %self.name, "Bulkhead stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Checkout {
                deadline,
                timeout,
                reply,
            } => self.checkout(deadline, timeout, reply),
            Command::Release { resource, reason } => self.release(resource, reason),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::ResetMetrics { reply } => {
                self.drop_abandoned_waiters();
                self.metrics = BulkheadMetrics {
                    current_usage: self.busy.len(),
                    peak_usage: self.busy.len(),
                    queue_size: self.waiting.len(),
                    peak_queue_size: self.waiting.len(),
                    ..BulkheadMetrics::default()
                };
                debug!(name = %self.name, "Bulkhead metrics reset");
                let _ = reply.send(());
            }
        }
    }

    fn checkout(
        &mut self,
        deadline: Option<Instant>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Lease>>,
    ) {
        self.metrics.total_checkouts += 1;
        self.drop_abandoned_waiters();

        if let Some(slot) = self.available.pop_front() {
            if !self.deliver(slot, reply) {
                self.available.push_front(slot);
            }
            return;
        }

        match deadline {
            Some(deadline) if self.waiting.len() < self.config.max_waiting => {
                self.waiting.push_back(Waiter {
                    deadline,
                    timeout,
                    reply,
                });
                self.update_queue_size();
                debug!(
                    name = %self.name,
                    position = self.waiting.len(),
                    "Checkout queued"
                );
            }
            _ => {
                self.metrics.rejected_checkouts += 1;
                warn!(
                    name = %self.name,
                    busy = self.busy.len(),
                    waiting = self.waiting.len(),
                    "Bulkhead full, rejecting checkout"
                );
                let _ = reply.send(Err(ResilienceError::BulkheadFull {
                    name: self.name.to_string(),
                }));
            }
        }
    }

    /// Bind `slot` to the caller behind `reply`. Returns false if the caller
    /// is gone, in which case the slot is still free.
    fn deliver(&mut self, slot: usize, reply: oneshot::Sender<Result<Lease>>) -> bool {
        let Some(tx) = self.self_tx.upgrade() else {
            return false;
        };

        self.sequence += 1;
        let resource = Resource {
            slot,
            sequence: self.sequence,
        };
        let lease = Lease {
            resource,
            bulkhead: self.name.clone(),
            tx: Some(tx),
        };

        match reply.send(Ok(lease)) {
            Ok(()) => {
                self.busy.insert(slot, resource.sequence);
                self.metrics.successful_checkouts += 1;
                self.metrics.current_usage = self.busy.len();
                self.metrics.peak_usage = self.metrics.peak_usage.max(self.busy.len());
                true
            }
            Err(Ok(mut lease)) => {
                lease.disarm();
                false
            }
            Err(Err(_)) => false,
        }
    }

    fn release(&mut self, resource: Resource, reason: ReleaseReason) {
        if self.busy.get(&resource.slot) != Some(&resource.sequence) {
            debug!(
                name = %self.name,
                slot = resource.slot,
                sequence = resource.sequence,
                "Ignoring release of a stale lease"
            );
            return;
        }

        self.busy.remove(&resource.slot);
        self.metrics.current_usage = self.busy.len();

        if reason == ReleaseReason::Abandoned {
            self.metrics.reclaimed += 1;
            warn!(
                name = %self.name,
                slot = resource.slot,
                "Reclaimed resource from a holder that went away"
            );
        }

        self.hand_off(resource.slot);
    }

    // Freed slots go to the longest waiting caller before anyone else.
    fn hand_off(&mut self, slot: usize) {
        let now = Instant::now();

        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            if waiter.deadline <= now {
                self.time_out(waiter);
                continue;
            }
            if self.deliver(slot, waiter.reply) {
                self.update_queue_size();
                return;
            }
        }

        self.update_queue_size();
        self.available.push_back(slot);
    }

    fn expire_waiters(&mut self) {
        let now = Instant::now();

        for waiter in std::mem::take(&mut self.waiting) {
            if waiter.reply.is_closed() {
                continue;
            }
            if waiter.deadline <= now {
                self.time_out(waiter);
            } else {
                self.waiting.push_back(waiter);
            }
        }

        self.update_queue_size();
    }

    fn time_out(&mut self, waiter: Waiter) {
        self.metrics.timeouts += 1;
        warn!(
            name = %self.name,
            timeout = ?waiter.timeout,
            "Checkout timed out while queued"
        );
        let _ = waiter.reply.send(Err(ResilienceError::Timeout {
            after: waiter.timeout,
        }));
    }

    fn drop_abandoned_waiters(&mut self) {
        self.waiting.retain(|waiter| !waiter.reply.is_closed());
        self.update_queue_size();
    }

    fn update_queue_size(&mut self) {
        self.metrics.queue_size = self.waiting.len();
        self.metrics.peak_queue_size = self.metrics.peak_queue_size.max(self.waiting.len());
    }

    fn snapshot(&self) -> BulkheadSnapshot {
        let waiting = self
            .waiting
            .iter()
            .filter(|waiter| !waiter.reply.is_closed())
            .count();

        BulkheadSnapshot {
            state: BulkheadState {
                name: self.config.name.clone(),
                available: self.available.len(),
                busy: self.busy.len(),
                waiting,
                max_concurrent: self.config.max_concurrent,
                max_waiting: self.config.max_waiting,
            },
            metrics: BulkheadMetrics {
                current_usage: self.busy.len(),
                queue_size: waiting,
                ..self.metrics.clone()
            },
        }
    }
}
