//! Fault-tolerance primitives for calls to unreliable dependencies.
//!
//! This crate provides the building blocks that keep one failing message
//! broker, HTTP API or LLM provider from taking the rest of a process down
//! with it:
//!
//! - **Circuit Breaker**: fail fast after repeated failures
//! - **Bulkhead**: bounded resource pool with a FIFO waiting queue
//! - **Retry**: exponential backoff with jitter
//! - **Timeout**: per-attempt deadlines
//! - **Coordinator**: all of the above composed per named dependency
//!
//! Circuit breakers and bulkheads each run as their own tokio task and are
//! driven through cloneable handles, so none of their state is shared behind
//! a lock.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{DependencyConfig, ResilienceCoordinator, RetryPolicy, Strategy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let coordinator = ResilienceCoordinator::new();
//! coordinator.register(
//!     DependencyConfig::new("amqp")
//!         .retry(RetryPolicy::new(5).base_backoff(Duration::from_millis(10)))
//!         .timeout(Duration::from_secs(2)),
//! );
//!
//! let published = coordinator
//!     .protect("amqp", || async { Ok::<_, String>(true) }, Strategy::FullResilience)
//!     .await
//!     .unwrap();
//! assert!(published);
//! # });
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod coordinator;
pub mod error;
pub mod failure;
pub mod health;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadSnapshot, BulkheadState, Lease, Resource,
};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
    StateChangeHook,
};
pub use coordinator::{BulkFailure, BulkOutcome, ProtectOptions, ResilienceCoordinator, Strategy};
pub use error::{ResilienceError, Result};
pub use failure::{capture, Failure, FailureKind};
pub use health::{assess, HealthProbe, HealthStatus};
pub use registry::{Dependency, DependencyConfig, DependencyRegistry};
pub use retry::{create_retry_fn, with_retry, RetryFn, RetryHook, RetryPolicy};
pub use timeout::with_timeout;
