//! Error types for protected calls.

use crate::failure::{Failure, FailureKind};
use std::time::Duration;
use thiserror::Error;

/// Every outcome of a protected call that is not a success.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    /// The circuit breaker rejected the call without running it.
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Both the bulkhead pool and its waiting queue are saturated.
    #[error("Bulkhead '{name}' is full")]
    BulkheadFull { name: String },

    /// A deadline elapsed while queued, backing off, or executing.
    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    /// Every retry attempt failed.
    #[error("Failed after {attempts} attempts: {last_error}")]
    MaxAttemptsReached { attempts: u32, last_error: Failure },

    /// The failure kind is not configured as retryable.
    #[error("Non-retryable {kind} failure: {detail}")]
    NonRetryable { kind: FailureKind, detail: String },

    /// The health gate blocked execution.
    #[error("System health is critical, '{name}' was not executed")]
    SystemCritical { name: String },

    /// The operation ran once and failed.
    #[error("Operation failed: {0}")]
    Operation(Failure),

    /// No dependency is registered under this name.
    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    /// The owning task of a breaker or bulkhead is gone.
    #[error("'{0}' is no longer running")]
    Unavailable(String),
}

impl ResilienceError {
    /// Stable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::Timeout { .. } => "timeout",
            Self::MaxAttemptsReached { .. } => "max_attempts_reached",
            Self::NonRetryable { .. } => "non_retryable",
            Self::SystemCritical { .. } => "system_critical",
            Self::Operation(_) => "operation_failed",
            Self::UnknownDependency(_) => "unknown_dependency",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Whether the call was turned away before the operation ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::SystemCritical { .. }
        )
    }

    /// The failure kind a circuit breaker should record for this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::MaxAttemptsReached { last_error, .. } => last_error.kind,
            Self::NonRetryable { kind, .. } => *kind,
            Self::Operation(failure) => failure.kind,
            _ => FailureKind::ErrorResult,
        }
    }
}

impl From<Failure> for ResilienceError {
    fn from(failure: Failure) -> Self {
        Self::Operation(failure)
    }
}

impl From<ResilienceError> for Failure {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Operation(failure) => failure,
            ResilienceError::MaxAttemptsReached { last_error, .. } => last_error,
            other => Failure::new(other.failure_kind(), other.to_string()),
        }
    }
}

/// Result type for protected calls.
pub type Result<T> = std::result::Result<T, ResilienceError>;
