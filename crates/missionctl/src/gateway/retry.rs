use std::future::Future;
use std::time::Duration;

use super::GatewayError;

const DEFAULT_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 250;

/// Run a gateway operation with bounded retries and a linearly growing
/// backoff. Only transport and timeout failures are retried.
pub async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    with_retry_attempts(op, DEFAULT_ATTEMPTS, &mut f).await
}

pub async fn with_retry_attempts<T, F, Fut>(
    op: &str,
    attempts: u32,
    f: &mut F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    op,
                    attempt,
                    error = %err,
                    "gateway call failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(BASE_DELAY_MS * attempt as u64)).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    // Unreachable: the loop always returns on the final attempt.
    Err(last_err.unwrap_or_else(|| GatewayError::Transport("retry exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test.op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Transport("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn protocol_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test.op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Protocol("bad params".into())) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test.op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
