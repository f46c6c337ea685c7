//! Integration tests for common Bulwark workflows.
//!
//! These tests drive the crates together the way a host service would.

use bulwark::prelude::*;
use bulwark_config::{ConfigLoader, FileFormat};
use bulwark_metrics::MetricsReporter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn coordinator_from_toml(toml: &str) -> ResilienceCoordinator {
    let document = ConfigLoader::new(FileFormat::Toml).parse(toml).unwrap();
    let settings = bulwark_config::ResilienceSettings::from_value(document).unwrap();
    let coordinator = ResilienceCoordinator::new();
    settings.register_all(&coordinator).unwrap();
    coordinator
}

// =============================================================================
// Configured Dependencies
// =============================================================================

#[tokio::test]
async fn test_configured_dependency_retries_then_succeeds() {
    let coordinator = coordinator_from_toml(
        r#"
        [dependencies.telegram]
        max_attempts = 4
        base_backoff_ms = 1
        jitter = false
        "#,
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let message_id = coordinator
        .protect(
            "telegram",
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("429 Too Many Requests")
                    } else {
                        Ok(42)
                    }
                }
            },
            Strategy::FullResilience,
        )
        .await
        .unwrap();

    assert_eq!(message_id, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unknown_dependency() {
    let coordinator = coordinator_from_toml("[dependencies.amqp]\n");

    let result = coordinator
        .protect("smtp", || async { Ok::<_, String>(()) }, Strategy::Simple)
        .await;

    assert!(matches!(result, Err(ResilienceError::UnknownDependency(name)) if name == "smtp"));
}

// =============================================================================
// Failing Dependency
// =============================================================================

#[tokio::test]
async fn test_failing_dependency_opens_and_reports() {
    let coordinator = coordinator_from_toml(
        r#"
        [defaults]
        max_attempts = 1

        [dependencies.llm]
        failure_threshold = 2
        open_timeout_ms = 60000

        [dependencies.amqp]
        "#,
    );

    for _ in 0..2 {
        let result = coordinator
            .protect("llm", || async { Err::<(), _>("503") }, Strategy::FullResilience)
            .await;
        assert!(result.is_err());
    }

    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();
    let result = coordinator
        .protect(
            "llm",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            Strategy::FullResilience,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.system_health().await, HealthStatus::Degraded);

    let text = MetricsReporter::for_coordinator(&coordinator)
        .export_prometheus()
        .await;
    assert!(text.contains("bulwark_circuit_breaker_state{circuit_breaker=\"llm\"} 2"));
    assert!(text.contains("bulwark_circuit_breaker_rejections_total{circuit_breaker=\"llm\"} 1"));
}

#[tokio::test]
async fn test_health_gate_blocks_when_critical() {
    let coordinator = coordinator_from_toml("[dependencies.amqp]\n");

    let result = coordinator
        .health_gated(
            "amqp",
            || async { Ok::<_, String>(()) },
            &HealthStatus::Critical,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::SystemCritical { .. })));
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn test_bulk_protect_isolates_failures() {
    let coordinator = coordinator_from_toml(
        r#"
        [dependencies.llm]
        max_attempts = 1
        max_concurrent = 2
        max_waiting = 8
        "#,
    );

    let outcome = coordinator
        .bulk_protect(
            "llm",
            (1..=6).collect::<Vec<u32>>(),
            |prompt| async move {
                if prompt % 3 == 0 {
                    Err(format!("prompt {} rejected", prompt))
                } else {
                    Ok(prompt * 10)
                }
            },
            ProtectOptions::new(Strategy::WithRetry),
        )
        .await
        .unwrap();

    assert_eq!(outcome.successes.len(), 4);
    assert_eq!(outcome.failures.len(), 2);
    assert!((outcome.success_rate - 4.0 / 6.0).abs() < f64::EPSILON);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_slow_dependency_times_out() {
    let coordinator = ResilienceCoordinator::new();
    coordinator.register(
        DependencyConfig::new("webhook")
            .timeout(Duration::from_millis(20))
            .retry(RetryPolicy::new(1)),
    );

    let result = coordinator
        .protect(
            "webhook",
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            },
            Strategy::WithTimeout,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
}
