//! Health assessment for protected dependencies.
//!
//! Health is derived from breaker and bulkhead state rather than measured
//! separately: a dependency whose breaker is tripped, or whose pool is fully
//! occupied, is already telling us something.
//!
//! Anything that can report a [`HealthStatus`] implements [`HealthProbe`].
//! Async closures do, so ad-hoc probes need no boilerplate:
//!
//! ```rust
//! use bulwark_core::{HealthProbe, HealthStatus};
//!
//! # tokio_test::block_on(async {
//! let probe = || async { HealthStatus::Degraded };
//! assert_eq!(probe.check().await, HealthStatus::Degraded);
//! # });
//! ```

use crate::bulkhead::BulkheadSnapshot;
use crate::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Coarse health of the system or a dependency, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything is functioning normally
    #[default]
    Healthy,
    /// Functioning, but with reduced capacity
    Degraded,
    /// Calls should not be attempted
    Critical,
}

impl HealthStatus {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }

    /// Numeric form for gauges: 0 healthy, 1 degraded, 2 critical.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Critical => 2,
        }
    }

    /// Returns true unless the status is critical.
    pub fn allows_execution(&self) -> bool {
        !matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a health verdict.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Report the current health.
    async fn check(&self) -> HealthStatus;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = HealthStatus> + Send,
{
    async fn check(&self) -> HealthStatus {
        self().await
    }
}

#[async_trait]
impl HealthProbe for HealthStatus {
    async fn check(&self) -> HealthStatus {
        *self
    }
}

/// Aggregate health from breaker and bulkhead snapshots.
///
/// Critical when at least one breaker is registered and every breaker is
/// open. Degraded when any breaker is not closed, or any bulkhead has callers
/// queued or no free slot. Healthy otherwise.
pub fn assess(breakers: &[CircuitBreakerSnapshot], bulkheads: &[BulkheadSnapshot]) -> HealthStatus {
    if !breakers.is_empty() && breakers.iter().all(|b| b.state == CircuitState::Open) {
        return HealthStatus::Critical;
    }

    let breaker_trouble = breakers.iter().any(|b| b.state != CircuitState::Closed);
    let bulkhead_pressure = bulkheads
        .iter()
        .any(|b| b.state.waiting > 0 || b.state.available == 0);

    if breaker_trouble || bulkhead_pressure {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::{BulkheadMetrics, BulkheadState};

    fn breaker(state: CircuitState) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: "b".to_string(),
            state,
            failure_count: 0,
            success_count: 0,
            failure_threshold: 5,
            success_threshold: 2,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            transitions: 0,
        }
    }

    fn bulkhead(available: usize, waiting: usize) -> BulkheadSnapshot {
        BulkheadSnapshot {
            state: BulkheadState {
                name: "p".to_string(),
                available,
                busy: 4 - available,
                waiting,
                max_concurrent: 4,
                max_waiting: 4,
            },
            metrics: BulkheadMetrics::default(),
        }
    }

    #[test]
    fn test_empty_system_is_healthy() {
        assert_eq!(assess(&[], &[]), HealthStatus::Healthy);
    }

    #[test]
    fn test_all_open_is_critical() {
        let breakers = [breaker(CircuitState::Open), breaker(CircuitState::Open)];
        assert_eq!(assess(&breakers, &[]), HealthStatus::Critical);
    }

    #[test]
    fn test_partial_trouble_is_degraded() {
        let breakers = [breaker(CircuitState::Open), breaker(CircuitState::Closed)];
        assert_eq!(assess(&breakers, &[]), HealthStatus::Degraded);

        let breakers = [breaker(CircuitState::HalfOpen)];
        assert_eq!(assess(&breakers, &[]), HealthStatus::Degraded);
    }

    #[test]
    fn test_saturated_bulkhead_is_degraded() {
        let breakers = [breaker(CircuitState::Closed)];
        assert_eq!(assess(&breakers, &[bulkhead(0, 0)]), HealthStatus::Degraded);
        assert_eq!(assess(&breakers, &[bulkhead(1, 2)]), HealthStatus::Degraded);
        assert_eq!(assess(&breakers, &[bulkhead(3, 0)]), HealthStatus::Healthy);
    }

    #[test]
    fn test_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Critical);
        assert!(!HealthStatus::Critical.allows_execution());
    }

    #[tokio::test]
    async fn test_status_is_a_probe() {
        assert_eq!(HealthStatus::Critical.check().await, HealthStatus::Critical);
    }
}
