//! Prometheus rendering of breaker and bulkhead snapshots
//!
//! Every export builds a fresh [`Registry`] from one [`TelemetrySnapshot`],
//! so counters always mirror the totals held by the breaker and bulkhead
//! actors rather than accumulating across scrapes.

use crate::TelemetrySnapshot;
use bulwark_core::CircuitState;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Prefix of every exported metric.
pub const NAMESPACE: &str = "bulwark";

/// Label carrying the breaker name.
pub const BREAKER_LABEL: &str = "circuit_breaker";

/// Label carrying the bulkhead name.
pub const BULKHEAD_LABEL: &str = "bulkhead";

/// Numeric form of a breaker state: 0 closed, 1 half-open, 2 open.
pub fn state_gauge(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    let opts = Opts::new(name, help).namespace(NAMESPACE);
    if subsystem.is_empty() {
        opts
    } else {
        opts.subsystem(subsystem)
    }
}

fn gauge_vec(
    registry: &Registry,
    subsystem: &str,
    label: &str,
    name: &str,
    help: &str,
) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(opts(subsystem, name, help), &[label])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter_vec(
    registry: &Registry,
    subsystem: &str,
    label: &str,
    name: &str,
    help: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(opts(subsystem, name, help), &[label])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

struct BreakerMetrics {
    state: IntGaugeVec,
    failure_count: IntGaugeVec,
    success_count: IntGaugeVec,
    calls: IntCounterVec,
    successes: IntCounterVec,
    failures: IntCounterVec,
    rejections: IntCounterVec,
    transitions: IntCounterVec,
}

impl BreakerMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name, help| gauge_vec(registry, "circuit_breaker", BREAKER_LABEL, name, help);
        let counter =
            |name, help| counter_vec(registry, "circuit_breaker", BREAKER_LABEL, name, help);
        Ok(Self {
            state: gauge("state", "Breaker state (0 closed, 1 half-open, 2 open)")?,
            failure_count: gauge("failure_count", "Consecutive failures in the current state")?,
            success_count: gauge("success_count", "Consecutive half-open successes")?,
            calls: counter("calls_total", "Calls admitted or rejected by the breaker")?,
            successes: counter("successes_total", "Calls recorded as successful")?,
            failures: counter("failures_total", "Calls recorded as failed")?,
            rejections: counter("rejections_total", "Calls rejected while open")?,
            transitions: counter("transitions_total", "State transitions")?,
        })
    }
}

struct BulkheadMetrics {
    available: IntGaugeVec,
    busy: IntGaugeVec,
    waiting: IntGaugeVec,
    max_concurrent: IntGaugeVec,
    max_waiting: IntGaugeVec,
    peak_usage: IntGaugeVec,
    peak_queue_size: IntGaugeVec,
    checkouts: IntCounterVec,
    successful_checkouts: IntCounterVec,
    rejected_checkouts: IntCounterVec,
    timeouts: IntCounterVec,
    reclaimed: IntCounterVec,
}

impl BulkheadMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name, help| gauge_vec(registry, "bulkhead", BULKHEAD_LABEL, name, help);
        let counter = |name, help| counter_vec(registry, "bulkhead", BULKHEAD_LABEL, name, help);
        Ok(Self {
            available: gauge("available", "Free resource slots")?,
            busy: gauge("busy", "Resource slots held by callers")?,
            waiting: gauge("waiting", "Callers queued for a slot")?,
            max_concurrent: gauge("max_concurrent", "Configured pool size")?,
            max_waiting: gauge("max_waiting", "Configured queue capacity")?,
            peak_usage: gauge("peak_usage", "Highest concurrent usage since the last reset")?,
            peak_queue_size: gauge("peak_queue_size", "Longest queue since the last reset")?,
            checkouts: counter("checkouts_total", "Checkout requests")?,
            successful_checkouts: counter(
                "successful_checkouts_total",
                "Checkouts that obtained a slot",
            )?,
            rejected_checkouts: counter(
                "rejected_checkouts_total",
                "Checkouts rejected with the pool and queue full",
            )?,
            timeouts: counter("timeouts_total", "Queued checkouts that gave up")?,
            reclaimed: counter("reclaimed_total", "Slots released because the holder went away")?,
        })
    }
}

/// Build a registry holding the metrics of one snapshot.
pub fn build_registry(snapshot: &TelemetrySnapshot) -> Result<Registry, prometheus::Error> {
    let registry = Registry::new();

    let health = IntGauge::with_opts(opts(
        "",
        "health",
        "Aggregate health (0 healthy, 1 degraded, 2 critical)",
    ))?;
    registry.register(Box::new(health.clone()))?;
    health.set(snapshot.health.as_gauge());

    let dependencies = IntGauge::with_opts(opts("", "dependencies", "Registered dependencies"))?;
    registry.register(Box::new(dependencies.clone()))?;
    dependencies.set(snapshot.circuit_breakers.len() as i64);

    let breakers = BreakerMetrics::register(&registry)?;
    for breaker in &snapshot.circuit_breakers {
        let name = [breaker.name.as_str()];
        breakers.state.with_label_values(&name).set(state_gauge(breaker.state));
        breakers.failure_count.with_label_values(&name).set(i64::from(breaker.failure_count));
        breakers.success_count.with_label_values(&name).set(i64::from(breaker.success_count));
        breakers.calls.with_label_values(&name).inc_by(breaker.total_calls);
        breakers.successes.with_label_values(&name).inc_by(breaker.total_successes);
        breakers.failures.with_label_values(&name).inc_by(breaker.total_failures);
        breakers.rejections.with_label_values(&name).inc_by(breaker.total_rejections);
        breakers.transitions.with_label_values(&name).inc_by(breaker.transitions);
    }

    let bulkheads = BulkheadMetrics::register(&registry)?;
    for bulkhead in &snapshot.bulkheads {
        let name = [bulkhead.state.name.as_str()];
        let (state, metrics) = (&bulkhead.state, &bulkhead.metrics);
        bulkheads.available.with_label_values(&name).set(state.available as i64);
        bulkheads.busy.with_label_values(&name).set(state.busy as i64);
        bulkheads.waiting.with_label_values(&name).set(state.waiting as i64);
        bulkheads.max_concurrent.with_label_values(&name).set(state.max_concurrent as i64);
        bulkheads.max_waiting.with_label_values(&name).set(state.max_waiting as i64);
        bulkheads.peak_usage.with_label_values(&name).set(metrics.peak_usage as i64);
        bulkheads.peak_queue_size.with_label_values(&name).set(metrics.peak_queue_size as i64);
        bulkheads.checkouts.with_label_values(&name).inc_by(metrics.total_checkouts);
        bulkheads
            .successful_checkouts
            .with_label_values(&name)
            .inc_by(metrics.successful_checkouts);
        bulkheads
            .rejected_checkouts
            .with_label_values(&name)
            .inc_by(metrics.rejected_checkouts);
        bulkheads.timeouts.with_label_values(&name).inc_by(metrics.timeouts);
        bulkheads.reclaimed.with_label_values(&name).inc_by(metrics.reclaimed);
    }

    Ok(registry)
}
