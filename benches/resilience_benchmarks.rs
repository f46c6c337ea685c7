#![allow(clippy::all)]

//! Resilience Pattern Benchmarks
//!
//! Benchmarks for circuit breakers, bulkheads, retry policies, timeouts and
//! the coordinator that composes them.

use bulwark::*;
use bulwark_metrics::MetricsReporter;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

// =============================================================================
// Circuit Breaker Benchmarks
// =============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let runtime = runtime();
    let _guard = runtime.enter();

    let cb = CircuitBreaker::start(CircuitBreakerConfig::new("bench").failure_threshold(1000));

    group.bench_function("get_state", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(cb.get_state().await.unwrap()) })
    });

    group.bench_function("call_success", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(cb.call(|| async { Ok::<_, String>(42) }).await.unwrap())
        })
    });

    let open = CircuitBreaker::start(CircuitBreakerConfig::new("open"));
    runtime.block_on(open.force_open()).unwrap();

    group.bench_function("call_rejected", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(open.call(|| async { Ok::<_, String>(42) }).await.is_err())
        })
    });

    group.finish();
}

// =============================================================================
// Bulkhead Benchmarks
// =============================================================================

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");
    let runtime = runtime();
    let _guard = runtime.enter();

    let bulkhead = Bulkhead::start(BulkheadConfig::new("bench").max_concurrent(100));

    group.bench_function("checkout_checkin", |b| {
        b.to_async(&runtime).iter(|| async {
            let lease = bulkhead.try_checkout().await.unwrap();
            bulkhead.checkin(lease);
        })
    });

    group.bench_function("with_resource", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                bulkhead
                    .with_resource(
                        |resource| async move { Ok::<_, String>(resource.slot) },
                        Duration::from_secs(1),
                    )
                    .await
                    .unwrap(),
            )
        })
    });

    group.finish();
}

// =============================================================================
// Retry Benchmarks
// =============================================================================

fn bench_retry(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry");

    let policy = RetryPolicy::default();
    for attempt in [1, 3, 5, 10] {
        group.bench_with_input(
            BenchmarkId::new("backoff_for", attempt),
            &attempt,
            |b, &attempt| b.iter(|| black_box(policy.backoff_for(attempt))),
        );
    }

    group.bench_function("delay_with_jitter", |b| {
        b.iter(|| black_box(policy.delay_for_attempt(3)))
    });

    let runtime = runtime();
    group.bench_function("first_attempt_success", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                with_retry(|| async { Ok::<_, String>(42) }, &policy)
                    .await
                    .unwrap(),
            )
        })
    });

    group.finish();
}

// =============================================================================
// Coordinator Benchmarks
// =============================================================================

fn bench_coordinator(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");
    let runtime = runtime();
    let _guard = runtime.enter();

    let coordinator = ResilienceCoordinator::new();
    coordinator.register(
        DependencyConfig::new("bench")
            .bulkhead(BulkheadConfig::new("bench").max_concurrent(100))
            .timeout(Duration::from_secs(30)),
    );

    for strategy in [
        Strategy::Simple,
        Strategy::WithTimeout,
        Strategy::WithCircuitBreaker,
        Strategy::FullResilience,
    ] {
        group.bench_with_input(
            BenchmarkId::new("protect", strategy),
            &strategy,
            |b, &strategy| {
                b.to_async(&runtime).iter(|| async {
                    black_box(
                        coordinator
                            .protect("bench", || async { Ok::<_, String>(42) }, strategy)
                            .await
                            .unwrap(),
                    )
                })
            },
        );
    }

    let reporter = MetricsReporter::for_coordinator(&coordinator);
    group.bench_function("export_prometheus", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(reporter.export_prometheus().await) })
    });

    group.finish();
}

criterion_group!(
    resilience_benches,
    bench_circuit_breaker,
    bench_bulkhead,
    bench_retry,
    bench_coordinator,
);

criterion_main!(resilience_benches);
