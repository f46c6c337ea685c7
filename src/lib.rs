// Bulwark - fault tolerance for calls to unreliable dependencies
//
// This library composes circuit breakers, bulkheads, retries and timeouts
// per named dependency, with optional configuration, logging and metrics.

// Re-export core functionality
pub use bulwark_core::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use bulwark_config;

#[cfg(feature = "metrics")]
pub use bulwark_metrics;

#[cfg(feature = "log")]
pub use bulwark_log;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BulkheadConfig,
        CircuitBreakerConfig,
        CircuitState,
        DependencyConfig,
        Failure,
        FailureKind,
        HealthProbe,
        HealthStatus,
        ProtectOptions,
        ResilienceCoordinator,
        ResilienceError,
        RetryPolicy,
        Strategy,
    };

    #[cfg(feature = "config")]
    pub use bulwark_config::{EnvLoader, ResilienceSettings, Validate};

    #[cfg(feature = "metrics")]
    pub use bulwark_metrics::{MetricsReporter, TelemetrySnapshot};
}
