//! Bounded retry for protocol operations.
//!
//! No loop in the protocol core retries forever. Wake-up probes and break attempts
//! run through [`retry`], which stops after `max_attempts` and hands back the last
//! concrete error so the caller sees *why* the final attempt failed.

use crate::error::{ProtocolError, ProtocolResult, RecoveryAction};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use mi_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.attempts(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Constant delay between a failed attempt and the next one.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts with 100ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and no backoff.
    pub fn attempts_only(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Effective attempt count.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Runs `op` until it succeeds, the policy is exhausted, or it fails with an
/// error whose [`RecoveryAction`] is not `Retry`.
///
/// `op` receives the 1-based attempt number. The error from the final attempt is
/// returned unchanged.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ProtocolResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProtocolResult<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && retryable(&err) => {
                debug!(attempt, attempts, error = %err, "Attempt failed, retrying");
                if !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn retryable(err: &ProtocolError) -> bool {
    err.recovery() == RecoveryAction::Retry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout(n: u32) -> ProtocolError {
        ProtocolError::Timeout {
            expected: format!("attempt {n}"),
            observed: "unknown".into(),
            timeout: Duration::from_millis(5),
            lines: vec![],
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::attempts_only(5);
        let value = retry(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(timeout(attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_concrete_error() {
        let policy = RetryPolicy::attempts_only(4);
        let err = retry(&policy, |attempt| async move { Err::<(), _>(timeout(attempt)) })
            .await
            .unwrap_err();
        match err {
            ProtocolError::Timeout { expected, .. } => assert_eq!(expected, "attempt 4"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_connection_loss() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::attempts_only(5);
        let err = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProtocolError::ConnectionLost("eof".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_backoff_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(250),
        };
        let start = tokio::time::Instant::now();
        let _ = retry(&policy, |attempt| async move { Err::<(), _>(timeout(attempt)) }).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::attempts_only(0).attempts(), 1);
    }
}
