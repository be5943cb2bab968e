use crate::config::RetryPolicy;
use crate::error::{GatewayError, GatewayResult};
use std::future::Future;

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of retries.
///
/// `op` receives the zero-based attempt number. Retryable failures that
/// exhaust the policy are wrapped in [`GatewayError::RetryExhausted`]; any
/// other error (validation, sandbox, circuit open) is returned as-is without
/// consuming further attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> GatewayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = label, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_retries {
                    tracing::warn!(
                        operation = label,
                        attempts = attempt + 1,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(GatewayError::RetryExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
