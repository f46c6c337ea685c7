//! Deadline enforcement for a single attempt.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{with_timeout, FailureKind};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let result = with_timeout(Duration::from_millis(10), async {
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     Ok::<_, String>(42)
//! })
//! .await;
//!
//! assert_eq!(result.unwrap_err().kind, FailureKind::Timeout);
//! # });
//! ```

use crate::failure::{capture, Failure};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `fut`, failing with [`FailureKind::Timeout`](crate::FailureKind::Timeout)
/// if it does not finish within `duration`.
///
/// Panics and error values are normalized the same way as [`capture`].
pub async fn with_timeout<Fut, T, E>(duration: Duration, fut: Fut) -> Result<T, Failure>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    match tokio::time::timeout(duration, capture(fut)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(duration = ?duration, "Operation timed out");
            Err(Failure::timeout(duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;

    #[tokio::test]
    async fn test_timeout_completes() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(42)
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_timeout_keeps_error_kind() {
        let result = with_timeout(Duration::from_secs(1), async { Err::<i32, _>("refused") }).await;
        assert_eq!(result.unwrap_err().kind, FailureKind::ErrorResult);
    }
}
