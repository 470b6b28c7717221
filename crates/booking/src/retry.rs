//! Exponential-backoff retry helper
//!
//! Small higher-order wrapper used wherever a transient external failure
//! is worth retrying (meeting creation, most notably). The operation gets
//! one initial attempt plus `max_retries` retries, with delays doubling
//! from `base_delay`; the last error is re-raised once the budget is
//! spent.

use std::future::Future;
use std::time::Duration;

use crate::error::BookingResult;

pub async fn with_retry<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> BookingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BookingResult<T>>,
{
    let mut failures = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if failures < max_retries => {
                // 1s, 2s, 4s, ... between attempts
                let delay = base_delay * 2u32.saturating_pow(failures);
                failures += 1;
                tracing::warn!(
                    retry = failures,
                    max_retries = max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(
                    attempts = failures + 1,
                    error = %err,
                    "Operation failed after exhausting retries"
                );
                return Err(err);
            }
        }
    }
}
