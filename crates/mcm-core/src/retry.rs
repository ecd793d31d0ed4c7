use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{McmError, Result};

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `should_retry`: Errors it rejects are returned at once.
/// - `op`: The closure to retry.
pub async fn retry_async<T, F, Fut, P>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&McmError) -> bool,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry with a constant delay between attempts, retrying every error.
pub async fn retry_fixed<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < attempts => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::Cell;

    fn always(_: &McmError) -> bool {
        true
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry_async(3, Duration::from_millis(1), "test", always, || async {
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Cell::new(0);
        let result = retry_async(3, Duration::from_millis(1), "test", always, || {
            let c = count.get() + 1;
            count.set(c);
            async move {
                if c < 3 {
                    return Err(McmError::backend("not yet"));
                }
                Ok(c)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = Cell::new(0);
        let result: Result<i32> = retry_async(3, Duration::from_millis(1), "test", always, || {
            count.set(count.get() + 1);
            async { Err(McmError::Conflict("always".to_string())) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(count.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_rejected_error() {
        let count = Cell::new(0);
        let result: Result<i32> = retry_async(
            5,
            Duration::from_millis(1),
            "test",
            McmError::is_conflict,
            || {
                count.set(count.get() + 1);
                async { Err(McmError::not_found("gone")) }
            },
        )
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(count.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fixed_waits_between_attempts() {
        let count = Cell::new(0);
        let start = tokio::time::Instant::now();
        let result = retry_fixed(4, Duration::from_secs(30), "ips", || {
            count.set(count.get() + 1);
            let c = count.get();
            async move {
                if c < 4 {
                    Err(McmError::not_found("no ip yet"))
                } else {
                    Ok("10.0.0.5")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "10.0.0.5");
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_retry_fixed_single_attempt() {
        let result: Result<i32> = retry_fixed(1, Duration::from_millis(1), "test", || async {
            Err(McmError::backend("fail"))
        })
        .await;
        assert!(result.is_err());
    }
}
