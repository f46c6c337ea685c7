//! Composition of the resilience primitives per named dependency.
//!
//! [`ResilienceCoordinator::protect`] is the single entry point callers use:
//! it looks up the dependency by name and runs the operation under the
//! requested [`Strategy`]. With [`Strategy::FullResilience`] the layers are,
//! from outside in:
//!
//! 1. circuit breaker gate (rejects before anything else runs),
//! 2. bulkhead lease, held across every attempt,
//! 3. retry with backoff,
//! 4. a timeout around each individual attempt.
//!
//! The whole call reports a single outcome to the breaker, so a call that
//! needed three attempts counts once. Rejections by the breaker or the
//! bulkhead are never retried.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{DependencyConfig, ResilienceCoordinator, Strategy};
//!
//! # tokio_test::block_on(async {
//! let coordinator = ResilienceCoordinator::new();
//! coordinator.register(DependencyConfig::new("telegram"));
//!
//! let sent = coordinator
//!     .protect("telegram", || async { Ok::<_, String>("sent") }, Strategy::FullResilience)
//!     .await
//!     .unwrap();
//! assert_eq!(sent, "sent");
//! # });
//! ```

use crate::error::{ResilienceError, Result};
use crate::failure::{capture, Failure, FailureKind};
use crate::health::{HealthProbe, HealthStatus};
use crate::registry::{Dependency, DependencyConfig, DependencyRegistry};
use crate::retry::{with_retry, RetryPolicy};
use crate::timeout::with_timeout;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which layers wrap the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Run once, only normalizing failures.
    Simple,
    /// Retry with the dependency's policy.
    WithRetry,
    /// Run once through the circuit breaker.
    WithCircuitBreaker,
    /// Run once with the dependency's timeout.
    WithTimeout,
    /// Breaker, bulkhead, retry and per-attempt timeout.
    #[default]
    FullResilience,
}

impl Strategy {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::WithRetry => "with_retry",
            Self::WithCircuitBreaker => "with_circuit_breaker",
            Self::WithTimeout => "with_timeout",
            Self::FullResilience => "full_resilience",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options. Unset fields fall back to the dependency's config.
#[derive(Debug, Clone, Default)]
pub struct ProtectOptions {
    pub strategy: Strategy,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl ProtectOptions {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Override the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl From<Strategy> for ProtectOptions {
    fn from(strategy: Strategy) -> Self {
        Self::new(strategy)
    }
}

/// One failed item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkFailure {
    /// Position of the item in the input.
    pub index: usize,
    pub error: ResilienceError,
}

/// Result of [`ResilienceCoordinator::bulk_protect`].
#[derive(Debug, Clone)]
pub struct BulkOutcome<T> {
    /// Successful results, in input order.
    pub successes: Vec<T>,
    pub failures: Vec<BulkFailure>,
    /// Fraction of items that succeeded; 1.0 for an empty batch.
    pub success_rate: f64,
}

/// Runs operations against named dependencies.
#[derive(Debug, Clone, Default)]
pub struct ResilienceCoordinator {
    registry: Arc<DependencyRegistry>,
}

impl ResilienceCoordinator {
    /// Create a coordinator with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a coordinator over an existing registry.
    pub fn with_registry(registry: Arc<DependencyRegistry>) -> Self {
        Self { registry }
    }

    /// The registry, for sharing with telemetry.
    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.registry
    }

    /// Register a dependency. See [`DependencyRegistry::register`].
    pub fn register(&self, config: DependencyConfig) -> Dependency {
        self.registry.register(config)
    }

    /// Registered dependency names, sorted.
    pub fn dependency_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Aggregate health of all dependencies.
    pub async fn system_health(&self) -> HealthStatus {
        self.registry.health().await
    }

    /// Run `operation` against dependency `name`.
    pub async fn protect<F, Fut, T, E>(
        &self,
        name: &str,
        mut operation: F,
        options: impl Into<ProtectOptions>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
    {
        let options = options.into();
        let dependency = self.registry.get(name)?;
        let timeout = options.timeout.unwrap_or(dependency.timeout);
        let policy = options.retry.as_ref().unwrap_or(dependency.retry.as_ref());

        debug!(name, strategy = %options.strategy, "Protecting call");

        match options.strategy {
            Strategy::Simple => capture(operation()).await.map_err(ResilienceError::Operation),
            Strategy::WithRetry => with_retry(operation, policy).await,
            Strategy::WithCircuitBreaker => dependency.breaker.call(operation).await,
            Strategy::WithTimeout => with_timeout(timeout, operation())
                .await
                .map_err(|failure| timeout_error(failure, timeout)),
            Strategy::FullResilience => {
                let permit = dependency.breaker.try_acquire().await?;

                let lease = match dependency
                    .bulkhead
                    .checkout(dependency.bulkhead.checkout_timeout())
                    .await
                {
                    Ok(lease) => lease,
                    Err(err) => {
                        // Saturation says nothing about the dependency itself.
                        permit.discard();
                        return Err(err);
                    }
                };

                let result = with_retry(|| with_timeout(timeout, operation()), policy).await;
                dependency.bulkhead.checkin(lease);

                match &result {
                    Ok(_) => permit.record_success(),
                    Err(err) => permit.record_failure(err.failure_kind()),
                }
                result
            }
        }
    }

    /// Run `item_fn` for every item concurrently, each under its own
    /// protection, so one item's failure never affects the others.
    ///
    /// Items share the dependency's bulkhead; a batch larger than the pool
    /// plus its queue will see `BulkheadFull` for the overflow.
    pub async fn bulk_protect<I, F, Fut, T, E>(
        &self,
        name: &str,
        items: Vec<I>,
        item_fn: F,
        options: impl Into<ProtectOptions>,
    ) -> Result<BulkOutcome<T>>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
    {
        self.registry.get(name)?;
        let options = options.into();
        let total = items.len();
        let item_fn = &item_fn;

        let runs = items.into_iter().map(|item| {
            let options = options.clone();
            async move {
                self.protect(name, || item_fn(item.clone()), options)
                    .await
            }
        });

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (index, result) in join_all(runs).await.into_iter().enumerate() {
            match result {
                Ok(value) => successes.push(value),
                Err(error) => failures.push(BulkFailure { index, error }),
            }
        }

        let success_rate = if total == 0 {
            1.0
        } else {
            successes.len() as f64 / total as f64
        };

        if !failures.is_empty() {
            warn!(
                name,
                total,
                failed = failures.len(),
                "Batch completed with failures"
            );
        }

        Ok(BulkOutcome {
            successes,
            failures,
            success_rate,
        })
    }

    /// Consult `probe` before running `operation` with full resilience.
    ///
    /// Degraded health still executes, critical health returns
    /// [`ResilienceError::SystemCritical`] without running anything.
    pub async fn health_gated<F, Fut, T, E, P>(
        &self,
        name: &str,
        operation: F,
        probe: &P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
        P: HealthProbe + ?Sized,
    {
        match probe.check().await {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded => {
                warn!(name, "System health degraded, executing anyway");
            }
            HealthStatus::Critical => {
                warn!(name, "System health critical, skipping execution");
                return Err(ResilienceError::SystemCritical {
                    name: name.to_string(),
                });
            }
        }

        self.protect(name, operation, Strategy::FullResilience)
            .await
    }
}

fn timeout_error(failure: Failure, after: Duration) -> ResilienceError {
    match failure.kind {
        FailureKind::Timeout => ResilienceError::Timeout { after },
        _ => ResilienceError::Operation(failure),
    }
}
