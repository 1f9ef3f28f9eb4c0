//! Shared exponential-backoff retry policy.
//!
//! One policy is used everywhere a transient failure can be retried: file
//! I/O in the built-in tools, `web_fetch`, and environment exec calls (§4.C,
//! §7 `transient-io`). Three attempts, waits of 1s, 2s, 4s, each clamped to
//! `[1s, 10s]`.

use std::future::Future;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
const MIN_WAIT: Duration = Duration::from_secs(1);
const MAX_WAIT: Duration = Duration::from_secs(10);

/// Backoff wait before attempt `attempt` (1-indexed: the wait *after*
/// attempt `attempt` failed, before attempt `attempt + 1`).
pub fn backoff_wait(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).clamp(MIN_WAIT, MAX_WAIT)
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, waiting with [`backoff_wait`]
/// between attempts, stopping early the first time `is_retryable` returns
/// `false` for the error.
pub async fn with_retry<T, E, Fut, Op, Retryable>(
    mut op: Op,
    is_retryable: Retryable,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Retryable: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= MAX_ATTEMPTS || !is_retryable(&error) {
                    return Err(error);
                }
                let wait = backoff_wait(attempt);
                tracing::debug!(attempt, ?wait, "retrying after transient error");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_sequence_matches_spec() {
        assert_eq!(backoff_wait(1), Duration::from_secs(1));
        assert_eq!(backoff_wait(2), Duration::from_secs(2));
        assert_eq!(backoff_wait(3), Duration::from_secs(4));
        assert_eq!(backoff_wait(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let result = with_retry(|| async { Ok::<_, &str>(42) }, |_| true).await;
        assert_eq!(result.unwrap(), 42);
    }
}
