use std::future::Future;
use std::time::Duration;

/// Retry an operation with exponential backoff, bounded by `max_attempts`.
///
/// Adapters use this at their boundary so transient transport failures never
/// leak upward; the delivery router itself stays a pure orchestrator and
/// runs no retry loops. `retry_if` filters which errors are worth retrying —
/// permanent failures return immediately.
pub async fn retry_with_backoff<T, E, P, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    retry_if: P,
    mut op: F,
) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !retry_if(&err) {
                    return Err(err);
                }
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            retry_with_backoff(3, Duration::from_millis(1), |_| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            retry_with_backoff(3, Duration::from_millis(1), |_| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still down") }
            })
            .await;

        assert_eq!(result, Err("still down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            retry_with_backoff(5, Duration::from_millis(1), |e| *e != "permanent", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            })
            .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
