//! Prometheus export and periodic reporting for Bulwark
//!
//! This crate observes the breakers and bulkheads held in a
//! [`bulwark_core::DependencyRegistry`] without changing them.
//!
//! # Features
//!
//! - **Snapshots** - breakers, bulkheads and aggregate health in one value
//! - **Prometheus Export** - text exposition with `bulwark_` metric names
//! - **Periodic Reports** - background task that logs and caches snapshots
//! - **Process Metrics** - optional CPU and memory gauges for the process
//!
//! # Quick Start
//!
//! ```
//! use bulwark_core::{DependencyConfig, ResilienceCoordinator};
//! use bulwark_metrics::MetricsReporter;
//!
//! # tokio_test::block_on(async {
//! let coordinator = ResilienceCoordinator::new();
//! coordinator.register(DependencyConfig::new("amqp"));
//!
//! let reporter = MetricsReporter::for_coordinator(&coordinator);
//! let text = reporter.export_prometheus().await;
//! assert!(text.contains("bulwark_circuit_breaker_state{circuit_breaker=\"amqp\"} 0"));
//! # });
//! ```

pub mod collector;
pub mod reporter;

pub use collector::{build_registry, state_gauge, BREAKER_LABEL, BULKHEAD_LABEL, NAMESPACE};
pub use prometheus;
pub use reporter::{MetricsReporter, PeriodicReporter, TelemetrySnapshot, MIN_REPORT_INTERVAL};

use once_cell::sync::Lazy;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};

/// Registry holding the process collector
static PROCESS_REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    // process_collector reads procfs
    #[cfg(target_os = "linux")]
    {
        if let Err(e) = registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        )) {
            tracing::warn!("Failed to register process collector: {}", e);
        }
    }

    registry
});

/// Registry with process metrics, shared by every reporter.
pub fn process_registry() -> &'static Registry {
    &PROCESS_REGISTRY
}

/// Export metrics from a specific registry
///
/// # Examples
///
/// ```
/// use bulwark_metrics::*;
/// use prometheus::Registry;
///
/// let registry = Registry::new();
/// let metrics = export_metrics_from_registry(&registry);
/// assert!(metrics.is_empty());
/// ```
pub fn export_metrics_from_registry(registry: &Registry) -> String {
    encode_families(&registry.gather())
}

/// Encode metric families in the text exposition format.
pub fn encode_families(families: &[MetricFamily]) -> String {
    let encoder = TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_registry() {
        // Families depend on the platform; only check it is readable.
        let _ = process_registry().gather();
    }

    #[test]
    fn test_export_empty_registry() {
        assert_eq!(export_metrics_from_registry(&Registry::new()), "");
    }
}
