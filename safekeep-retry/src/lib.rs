//! Bounded retry, backoff and timeout helpers for safekeep collaborators
//!
//! Uploads to external storage are the only pipeline calls that cross the
//! network. This crate gives them a consistent retry policy (exponential
//! backoff with a hard attempt cap) and a deadline wrapper so a hung remote
//! surfaces as [`RetryError::TimedOut`] instead of blocking the caller.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    TimedOut {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Retry policy: an exponential backoff schedule plus an attempt cap
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy tuned for artifact uploads to object storage
    pub fn upload() -> Self {
        Self::new(4, cloud_storage_backoff_policy())
    }

    /// Same schedule with a different attempt cap
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, default_backoff_policy())
    }
}

/// Execute an operation with a custom retry policy
///
/// `f` receives the 1-based attempt number. Transient errors are retried
/// after the next backoff interval until the attempt cap or the policy's
/// elapsed-time budget is reached; any other error is returned immediately.
pub async fn with_policy<F, T>(op_name: &'static str, policy: RetryPolicy, mut f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    let RetryPolicy {
        max_attempts,
        mut backoff,
    } = policy;
    backoff.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(RetryError::Transient { source, .. }) => {
                let delay = match backoff.next_backoff() {
                    Some(delay) if attempt < max_attempts => delay,
                    _ => {
                        warn!(operation = op_name, attempt, error = %source, "Giving up");
                        return Err(RetryError::MaxRetriesExceeded {
                            operation: op_name,
                            attempts: attempt,
                            source,
                        });
                    }
                };

                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(err);
            }
        }
    }
}

/// Run `fut` with a deadline
pub async fn with_timeout<T, Fut>(op_name: &'static str, timeout: Duration, fut: Fut) -> RetryResult<T>
where
    Fut: Future<Output = RetryResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = op_name, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
            Err(RetryError::TimedOut {
                operation: op_name,
                timeout,
            })
        }
    }
}

/// Retry under `policy`, bounding the whole sequence (all attempts and
/// backoff sleeps) by `timeout`
pub async fn with_policy_and_timeout<F, T>(
    op_name: &'static str,
    policy: RetryPolicy,
    timeout: Duration,
    f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    with_timeout(op_name, timeout, with_policy(op_name, policy, f)).await
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for cloud storage uploads
pub fn cloud_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(120)))
        .with_multiplier(1.5)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn refused(op: &'static str) -> RetryError {
        RetryError::Transient {
            operation: op,
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
        }
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result = with_policy("test_op", RetryPolicy::default(), |_attempt| {
            Box::pin(async { Ok("success") })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_policy("test_op", RetryPolicy::upload(), move |_attempt| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(refused("test_op"))
                } else {
                    Ok("success")
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<()> = with_policy(
            "upload",
            RetryPolicy::default().with_max_attempts(2),
            move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(refused("upload")) })
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { attempts: 2, .. })
        ));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<&str> =
            with_policy("test_op", RetryPolicy::default(), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {
                    Err(RetryError::Permanent {
                        operation: "test_op",
                        source: Box::new(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "permission denied",
                        )),
                    })
                })
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result: RetryResult<()> = with_timeout("upload", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RetryError::TimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_all_retries() {
        let result: RetryResult<()> = with_policy_and_timeout(
            "upload",
            RetryPolicy::upload().with_max_attempts(100),
            Duration::from_secs(3),
            |_attempt| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Err(refused("upload"))
                })
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::TimedOut { .. })));
    }
}
