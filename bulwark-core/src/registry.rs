//! Named dependencies and their protection handles.
//!
//! Every external dependency gets exactly one circuit breaker and one bulkhead,
//! created when it is registered and kept for the life of the process. The
//! registry is passed around explicitly (the coordinator owns one, telemetry
//! borrows it) instead of being looked up globally.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::error::{ResilienceError, Result};
use crate::health::{assess, HealthProbe, HealthStatus};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything needed to protect one dependency.
#[derive(Debug, Clone)]
pub struct DependencyConfig {
    pub name: String,
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
    pub retry: RetryPolicy,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl DependencyConfig {
    /// Defaults for every component, all named after the dependency.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            circuit_breaker: CircuitBreakerConfig::new(name.clone()),
            bulkhead: BulkheadConfig::new(name.clone()),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
            name,
        }
    }

    /// Set the circuit breaker configuration. Its name is replaced by the
    /// dependency name.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = CircuitBreakerConfig {
            name: self.name.clone(),
            ..config
        };
        self
    }

    /// Set the bulkhead configuration. Its name is replaced by the dependency
    /// name.
    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = BulkheadConfig {
            name: self.name.clone(),
            ..config
        };
        self
    }

    /// Set the default retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A registered dependency. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: Arc<str>,
    pub breaker: CircuitBreaker,
    pub bulkhead: Bulkhead,
    pub retry: Arc<RetryPolicy>,
    pub timeout: Duration,
}

/// Name to handle map shared by the coordinator and telemetry.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    dependencies: RwLock<HashMap<String, Dependency>>,
}

impl DependencyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the breaker and bulkhead for `config` and register them.
    ///
    /// Registering a name twice returns the existing dependency untouched.
    /// Must be called from within a tokio runtime.
    pub fn register(&self, config: DependencyConfig) -> Dependency {
        let mut dependencies = self.dependencies.write();

        if let Some(existing) = dependencies.get(&config.name) {
            debug!(name = %config.name, "Dependency already registered");
            return existing.clone();
        }

        info!(
            name = %config.name,
            timeout = ?config.timeout,
            max_attempts = config.retry.max_attempts,
            "Registering dependency"
        );

        let dependency = Dependency {
            name: Arc::from(config.name.as_str()),
            breaker: CircuitBreaker::start(config.circuit_breaker),
            bulkhead: Bulkhead::start(config.bulkhead),
            retry: Arc::new(config.retry),
            timeout: config.timeout,
        };
        dependencies.insert(config.name, dependency.clone());

        dependency
    }

    /// Look up a dependency by name.
    pub fn get(&self, name: &str) -> Result<Dependency> {
        self.dependencies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ResilienceError::UnknownDependency(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered dependencies, sorted by name.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut dependencies: Vec<Dependency> =
            self.dependencies.read().values().cloned().collect();
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        dependencies
    }

    pub fn len(&self) -> usize {
        self.dependencies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.read().is_empty()
    }

    /// Current state of every breaker, sorted by name.
    pub async fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let dependencies = self.dependencies();
        join_all(dependencies.iter().map(|d| d.breaker.get_state()))
            .await
            .into_iter()
            .filter_map(|snapshot| snapshot.ok())
            .collect()
    }

    /// Current state and metrics of every bulkhead, sorted by name.
    pub async fn bulkhead_snapshots(&self) -> Vec<BulkheadSnapshot> {
        let dependencies = self.dependencies();
        join_all(dependencies.iter().map(|d| d.bulkhead.snapshot()))
            .await
            .into_iter()
            .filter_map(|snapshot| snapshot.ok())
            .collect()
    }

    /// Aggregate health of every registered dependency.
    pub async fn health(&self) -> HealthStatus {
        let (breakers, bulkheads) =
            futures_util::join!(self.breaker_snapshots(), self.bulkhead_snapshots());
        assess(&breakers, &bulkheads)
    }
}

#[async_trait]
impl HealthProbe for DependencyRegistry {
    async fn check(&self) -> HealthStatus {
        self.health().await
    }
}
