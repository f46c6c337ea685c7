//! Circuit Breaker pattern implementation.
//!
//! The circuit breaker prevents cascade failures by monitoring for failures
//! and "opening" the circuit to reject requests when a failure threshold is reached.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Circuit is tripped, requests are rejected immediately
//! - **Half-Open**: Probing whether the dependency has recovered
//!
//! Each breaker is owned by a single tokio task. Callers talk to it through a
//! cloneable [`CircuitBreaker`] handle; the operation itself runs on the
//! caller's task and only its outcome is reported back, so a slow operation
//! never stalls other callers of the same breaker.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let breaker = CircuitBreaker::start(
//!     CircuitBreakerConfig::new("payments-api")
//!         .failure_threshold(1)
//!         .open_timeout(Duration::from_secs(30)),
//! );
//!
//! let _ = breaker.call(|| async { Err::<(), _>("503 from upstream") }).await;
//!
//! let result = breaker.call(|| async { Ok::<_, String>("never runs") }).await;
//! assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
//! # });
//! ```

use crate::error::{ResilienceError, Result};
use crate::failure::{capture, panic_message, Failure, FailureKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Hook invoked on every state transition with `(name, old, new)`.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl CircuitState {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (for logging/metrics).
    pub name: String,
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Number of half-open successes needed to close the circuit.
    pub success_threshold: u32,
    /// Time to stay open before admitting a probe call.
    pub open_timeout: Duration,
    /// Forget accumulated failures once the last one is older than this.
    pub reset_timeout: Option<Duration>,
    /// Called synchronously on every transition.
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            reset_timeout: None,
            on_state_change: None,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("reset_timeout", &self.reset_timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for recovery.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the failure decay timer.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = Some(timeout);
        self
    }

    /// Set the state change hook.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted toward opening (closed) or reopening (half-open).
    pub failure_count: u32,
    /// Successes counted toward closing while half-open.
    pub success_count: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured success threshold.
    pub success_threshold: u32,
    /// Calls offered to the breaker, admitted or not.
    pub total_calls: u64,
    /// Admitted calls that succeeded.
    pub total_successes: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
    /// Number of state transitions.
    pub transitions: u64,
}

impl CircuitBreakerSnapshot {
    /// Calculate failure rate over admitted calls (0.0 - 1.0).
    pub fn failure_rate(&self) -> f64 {
        let settled = self.total_successes + self.total_failures;
        if settled == 0 {
            0.0
        } else {
            self.total_failures as f64 / settled as f64
        }
    }
}

enum Admission {
    Allowed { epoch: u64 },
    Rejected,
}

enum Command {
    Acquire {
        reply: oneshot::Sender<Admission>,
    },
    Report {
        epoch: u64,
        outcome: std::result::Result<(), FailureKind>,
    },
    GetState {
        reply: oneshot::Sender<CircuitBreakerSnapshot>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    ForceOpen {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running circuit breaker.
///
/// Cloning is cheap; all clones talk to the same owning task, which stops
/// once every handle and outstanding permit is dropped.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .finish()
    }
}

impl CircuitBreaker {
    /// Spawn the owning task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            open_timeout = ?config.open_timeout,
            "Circuit breaker initialized"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(config.name.as_str());
        tokio::spawn(BreakerActor::new(config, rx).run());

        Self { name, tx }
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for admission. The returned permit must be settled with the
    /// outcome; dropping it unsettled records a [`FailureKind::Cancelled`].
    pub async fn try_acquire(&self) -> Result<BreakerPermit> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire { reply })?;

        match rx.await.map_err(|_| self.unavailable())? {
            Admission::Allowed { epoch } => Ok(BreakerPermit {
                breaker: self.clone(),
                epoch,
                settled: false,
            }),
            Admission::Rejected => {
                debug!(name = %self.name, "Circuit breaker rejected request");
                Err(ResilienceError::CircuitOpen {
                    name: self.name.to_string(),
                })
            }
        }
    }

    /// Execute a function with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
    {
        let permit = self.try_acquire().await?;

        match capture(async move { operation().await }).await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(failure) => {
                permit.record_failure(failure.kind);
                Err(ResilienceError::Operation(failure))
            }
        }
    }

    /// Read the current state. Never changes the state, even if the open
    /// timeout has already elapsed.
    pub async fn get_state(&self) -> Result<CircuitBreakerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetState { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Force the circuit closed with zeroed counters.
    pub async fn reset(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Manually force the circuit open.
    pub async fn force_open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceOpen { reply })?;
        rx.await.map_err(|_| self.unavailable())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> ResilienceError {
        ResilienceError::Unavailable(self.name.to_string())
    }
}

/// Admission to run one call through a breaker.
#[must_use = "a permit dropped without an outcome is recorded as cancelled"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    epoch: u64,
    settled: bool,
}

impl BreakerPermit {
    /// Record that the admitted call succeeded.
    pub fn record_success(mut self) {
        self.settle(Ok(()));
    }

    /// Record that the admitted call failed.
    pub fn record_failure(mut self, kind: FailureKind) {
        self.settle(Err(kind));
    }

    /// Give the permit back without recording anything.
    pub fn discard(mut self) {
        self.settled = true;
    }

    fn settle(&mut self, outcome: std::result::Result<(), FailureKind>) {
        self.settled = true;
        // The owning task only goes away once every sender is dropped.
        let _ = self.breaker.tx.send(Command::Report {
            epoch: self.epoch,
            outcome,
        });
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err(FailureKind::Cancelled));
        }
    }
}

struct BreakerActor {
    config: CircuitBreakerConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    // Bumped on every transition; outcomes admitted in an older epoch are stale.
    epoch: u64,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    transitions: u64,
}

impl BreakerActor {
    fn new(config: CircuitBreakerConfig, rx: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            config,
            rx,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_at: None,
            epoch: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            transitions: 0,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Acquire { reply } => {
                    let admission = self.admit();
                    let _ = reply.send(admission);
                }
                Command::Report { epoch, outcome } => self.record(epoch, outcome),
                Command::GetState { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Reset { reply } => {
                    self.reset();
                    let _ = reply.send(());
                }
                Command::ForceOpen { reply } => {
                    warn!(name = %self.config.name, "Circuit breaker forced open");
                    if self.state != CircuitState::Open {
                        self.transition(CircuitState::Open);
                    }
                    let _ = reply.send(());
                }
            }
        }

        debug!(name = %self.config.name, "Circuit breaker stopped");
    }

    fn admit(&mut self) -> Admission {
        self.total_calls += 1;

        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::MAX);
            if elapsed < self.config.open_timeout {
                self.total_rejections += 1;
                return Admission::Rejected;
            }
            self.transition(CircuitState::HalfOpen);
        }

        Admission::Allowed { epoch: self.epoch }
    }

    fn record(&mut self, epoch: u64, outcome: std::result::Result<(), FailureKind>) {
        match outcome {
            Ok(()) => self.total_successes += 1,
            Err(_) => self.total_failures += 1,
        }

        if epoch != self.epoch {
            debug!(
                name = %self.config.name,
                state = %self.state,
                "Ignoring outcome admitted before the last transition"
            );
            return;
        }

        match (self.state, outcome) {
            (CircuitState::Closed, Ok(())) => {
                self.failure_count = 0;
            }
            (CircuitState::Closed, Err(kind)) => {
                let now = Instant::now();
                if let Some(decay) = self.config.reset_timeout
                    && let Some(last) = self.last_failure_at
                    && now.duration_since(last) >= decay
                {
                    debug!(name = %self.config.name, "Failure count decayed");
                    self.failure_count = 0;
                }
                self.last_failure_at = Some(now);
                self.failure_count += 1;

                debug!(
                    name = %self.config.name,
                    kind = %kind,
                    failures = self.failure_count,
                    "Failure recorded"
                );

                if self.failure_count >= self.config.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Ok(())) => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, Err(_)) => {
                self.failure_count += 1;
                self.transition(CircuitState::Open);
            }
            // Open never admits, so there is nothing to count.
            (CircuitState::Open, _) => {}
        }
    }

    fn reset(&mut self) {
        info!(name = %self.config.name, "Circuit breaker reset");
        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed);
        } else {
            self.epoch += 1;
        }
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_at = None;
    }

    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.epoch += 1;
        self.transitions += 1;

        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.success_count = 0;
                warn!(
                    name = %self.config.name,
                    from = %from,
                    failures = self.failure_count,
                    "Circuit breaker OPENED"
                );
            }
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.success_count = 0;
                info!(name = %self.config.name, "Circuit breaker HALF-OPEN");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.last_failure_at = None;
                self.failure_count = 0;
                self.success_count = 0;
                info!(name = %self.config.name, from = %from, "Circuit breaker CLOSED");
            }
        }

        self.notify(from, to);
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        let Some(hook) = &self.config.on_state_change else {
            return;
        };

        let name = self.config.name.as_str();
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(name, from, to))) {
            error!(
                name = %name,
                from = %from,
                to = %to,
                panic = %panic_message(payload.as_ref()),
                "State change hook panicked"
            );
        }
    }

    fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            total_calls: self.total_calls,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
            transitions: self.transitions,
        }
    }
}
