//! Snapshots and periodic reporting

use crate::collector::build_registry;
use crate::{encode_families, process_registry};
use bulwark_core::{
    assess, BulkheadSnapshot, CircuitBreakerSnapshot, CircuitState, DependencyRegistry,
    HealthStatus, ResilienceCoordinator,
};
use bulwark_log::{debug, error, info, warn};
use prometheus::proto::MetricFamily;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest period accepted by [`MetricsReporter::spawn_periodic`].
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Point-in-time view of every registered breaker and bulkhead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub bulkheads: Vec<BulkheadSnapshot>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub health: HealthStatus,
}

impl TelemetrySnapshot {
    /// Build a snapshot and derive its health from the parts.
    pub fn new(
        circuit_breakers: Vec<CircuitBreakerSnapshot>,
        bulkheads: Vec<BulkheadSnapshot>,
    ) -> Self {
        let health = assess(&circuit_breakers, &bulkheads);
        Self {
            bulkheads,
            circuit_breakers,
            health,
        }
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        self.render(Vec::new())
    }

    /// Encode this snapshot's families followed by `extra`.
    fn render(&self, extra: Vec<MetricFamily>) -> String {
        match build_registry(self) {
            Ok(registry) => {
                let mut families = registry.gather();
                families.extend(extra);
                encode_families(&families)
            }
            Err(e) => {
                error!("Failed to build resilience metrics: {}", e);
                String::from("# Error building metrics\n")
            }
        }
    }

    /// Breaker snapshot by name.
    pub fn circuit_breaker(&self, name: &str) -> Option<&CircuitBreakerSnapshot> {
        self.circuit_breakers.iter().find(|b| b.name == name)
    }

    /// Bulkhead snapshot by name.
    pub fn bulkhead(&self, name: &str) -> Option<&BulkheadSnapshot> {
        self.bulkheads.iter().find(|b| b.state.name == name)
    }

    fn log_summary(&self) {
        let open = self
            .circuit_breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .count();
        let half_open = self
            .circuit_breakers
            .iter()
            .filter(|b| b.state == CircuitState::HalfOpen)
            .count();
        let queued: usize = self.bulkheads.iter().map(|b| b.state.waiting).sum();
        let busy: usize = self.bulkheads.iter().map(|b| b.state.busy).sum();

        match self.health {
            HealthStatus::Healthy => info!(
                health = %self.health,
                dependencies = self.circuit_breakers.len(),
                busy,
                "Resilience report"
            ),
            HealthStatus::Degraded => warn!(
                health = %self.health,
                open,
                half_open,
                busy,
                queued,
                "Resilience report"
            ),
            HealthStatus::Critical => error!(
                health = %self.health,
                open,
                dependencies = self.circuit_breakers.len(),
                "Resilience report"
            ),
        }

        for breaker in self.circuit_breakers.iter().filter(|b| b.state != CircuitState::Closed) {
            debug!(
                circuit_breaker = %breaker.name,
                state = %breaker.state,
                failures = breaker.total_failures,
                rejections = breaker.total_rejections,
                "Breaker not closed"
            );
        }
    }
}

/// Observes every dependency of a registry.
///
/// Reporting only reads breaker and bulkhead state.
#[derive(Clone)]
pub struct MetricsReporter {
    registry: Arc<DependencyRegistry>,
    process_metrics: bool,
}

impl MetricsReporter {
    /// Create a reporter over a registry.
    pub fn new(registry: Arc<DependencyRegistry>) -> Self {
        Self {
            registry,
            process_metrics: false,
        }
    }

    /// Create a reporter over the coordinator's registry.
    pub fn for_coordinator(coordinator: &ResilienceCoordinator) -> Self {
        Self::new(Arc::clone(coordinator.registry()))
    }

    /// Append process metrics (CPU, memory, file descriptors) to the export.
    pub fn with_process_metrics(mut self, enabled: bool) -> Self {
        self.process_metrics = enabled;
        self
    }

    /// Current state of every breaker and bulkhead.
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let (circuit_breakers, bulkheads) = tokio::join!(
            self.registry.breaker_snapshots(),
            self.registry.bulkhead_snapshots()
        );
        TelemetrySnapshot::new(circuit_breakers, bulkheads)
    }

    /// Current state in the Prometheus text exposition format.
    pub async fn export_prometheus(&self) -> String {
        let extra = if self.process_metrics {
            process_registry().gather()
        } else {
            Vec::new()
        };
        self.snapshot().await.render(extra)
    }

    /// Report on a fixed interval until the returned handle is stopped or dropped.
    ///
    /// The first report is taken immediately.
    pub fn spawn_periodic(&self, interval: Duration) -> PeriodicReporter {
        let period = interval.max(MIN_REPORT_INTERVAL);
        let (latest_tx, latest_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(run_periodic(self.clone(), period, latest_tx, shutdown_rx));
        debug!(interval_ms = period.as_millis() as u64, "Periodic reporter started");

        PeriodicReporter {
            latest: latest_rx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

async fn run_periodic(
    reporter: MetricsReporter,
    period: Duration,
    latest: watch::Sender<Option<TelemetrySnapshot>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let snapshot = reporter.snapshot().await;
                snapshot.log_summary();
                latest.send_replace(Some(snapshot));
            }
        }
    }

    debug!("Periodic reporter stopped");
}

/// Handle to a background reporting task.
///
/// Dropping the handle aborts the task.
pub struct PeriodicReporter {
    latest: watch::Receiver<Option<TelemetrySnapshot>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicReporter {
    /// Most recent report, if one has been taken.
    pub fn last_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.latest.borrow().clone()
    }

    /// Wait for the next report.
    ///
    /// Returns `None` once the task has stopped.
    pub async fn next_snapshot(&mut self) -> Option<TelemetrySnapshot> {
        self.latest.changed().await.ok()?;
        self.latest.borrow_and_update().clone()
    }

    /// Stop reporting and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && e.is_panic()
        {
            error!("Periodic reporter panicked: {}", e);
        }
    }
}

impl Drop for PeriodicReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{BulkheadConfig, DependencyConfig};

    fn registry_with(names: &[&str]) -> Arc<DependencyRegistry> {
        let registry = Arc::new(DependencyRegistry::new());
        for name in names {
            registry.register(
                DependencyConfig::new(*name).bulkhead(BulkheadConfig::new(*name).max_concurrent(2)),
            );
        }
        registry
    }

    #[tokio::test]
    async fn test_snapshot_empty_registry() {
        let reporter = MetricsReporter::new(Arc::new(DependencyRegistry::new()));
        let snapshot = reporter.snapshot().await;

        assert!(snapshot.bulkheads.is_empty());
        assert!(snapshot.circuit_breakers.is_empty());
        assert_eq!(snapshot.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_snapshot_lookup_by_name() {
        let reporter = MetricsReporter::new(registry_with(&["amqp", "llm"]));
        let snapshot = reporter.snapshot().await;

        assert_eq!(snapshot.circuit_breakers.len(), 2);
        assert_eq!(snapshot.bulkhead("amqp").unwrap().state.available, 2);
        assert_eq!(
            snapshot.circuit_breaker("llm").unwrap().state,
            CircuitState::Closed
        );
        assert!(snapshot.bulkhead("missing").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_json_shape() {
        let reporter = MetricsReporter::new(registry_with(&["amqp"]));
        let json = reporter.snapshot().await.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["health"], "healthy");
        assert_eq!(value["circuit_breakers"][0]["state"], "closed");
        assert_eq!(value["bulkheads"][0]["name"], "amqp");
        assert_eq!(value["bulkheads"][0]["metrics"]["total_checkouts"], 0);
    }

    #[tokio::test]
    async fn test_export_matches_snapshot_rendering() {
        let reporter = MetricsReporter::new(registry_with(&["amqp", "llm"]));
        let expected = reporter.snapshot().await.to_prometheus();

        assert!(expected.contains("bulwark_circuit_breaker_state"));
        assert_eq!(reporter.export_prometheus().await, expected);

        let with_process = reporter.clone().with_process_metrics(true);
        assert!(with_process.export_prometheus().await.starts_with(&expected));
    }

    #[tokio::test]
    async fn test_periodic_reporter_stops() {
        let reporter = MetricsReporter::new(registry_with(&["amqp"]));
        let mut periodic = reporter.spawn_periodic(Duration::from_millis(10));

        let first = periodic.next_snapshot().await.unwrap();
        assert_eq!(first.circuit_breakers.len(), 1);
        assert!(periodic.last_snapshot().is_some());

        periodic.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let reporter = MetricsReporter::new(registry_with(&["amqp"]));
        let mut periodic = reporter.spawn_periodic(Duration::ZERO);

        assert!(periodic.next_snapshot().await.is_some());
        assert!(periodic.next_snapshot().await.is_some());
    }
}
