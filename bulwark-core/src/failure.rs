//! Uniform failure capture.
//!
//! A protected operation can go wrong in several ways: it returns an error,
//! it panics, it runs past its deadline, or the caller abandons it. Retry and
//! circuit breaker logic only ever see a [`Failure`], so every one of these is
//! normalized by [`capture`] (or by [`with_timeout`](crate::with_timeout))
//! before it reaches them.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{capture, FailureKind};
//!
//! # tokio_test::block_on(async {
//! let result = capture(async { Err::<(), _>("connection refused") }).await;
//! assert_eq!(result.unwrap_err().kind, FailureKind::ErrorResult);
//! # });
//! ```

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Closed classification of everything that can go wrong in a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation panicked.
    Panic,
    /// The operation returned an error value.
    ErrorResult,
    /// The operation exceeded its deadline.
    Timeout,
    /// The operation was abandoned before it produced an outcome.
    Cancelled,
}

impl FailureKind {
    /// Every failure kind, in declaration order.
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Panic,
        FailureKind::ErrorResult,
        FailureKind::Timeout,
        FailureKind::Cancelled,
    ];

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::ErrorResult => "error_result",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized failure: what kind it was and a human readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Description taken from the error value or panic payload.
    pub detail: String,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// An error returned by the operation.
    pub fn error(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ErrorResult, detail)
    }

    /// A panic raised by the operation.
    pub fn panic(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Panic, detail)
    }

    /// A deadline that elapsed before the operation finished.
    pub fn timeout(after: Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("timed out after {:?}", after))
    }

    /// An operation whose caller went away.
    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, detail)
    }

    /// Build a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::panic(panic_message(payload.as_ref()))
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Failure {}

impl From<&str> for Failure {
    fn from(detail: &str) -> Self {
        Self::error(detail)
    }
}

impl From<String> for Failure {
    fn from(detail: String) -> Self {
        Self::error(detail)
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::new(FailureKind::Timeout, err.to_string()),
            _ => Self::error(err.to_string()),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Failure {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::error(err.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::error(err.to_string())
    }
}

/// Run `fut` and normalize its outcome, turning a panic into
/// [`FailureKind::Panic`] instead of unwinding into the caller.
pub async fn capture<Fut, T, E>(fut: Fut) -> Result<T, Failure>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(payload) => Err(Failure::from_panic(payload)),
    }
}

/// Extract the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
