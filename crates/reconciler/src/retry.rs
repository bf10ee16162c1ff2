//! Bounded in-cycle retry for transient gateway failures.
//!
//! Exponential backoff with jitter, honoring server-suggested delays when
//! the error carries one. Non-transient errors (validation, auth,
//! duplicate-oid) are returned immediately so the caller can apply its own
//! semantics.

use palisade_core::{GatewayError, RetryConfig};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs `operation`, retrying transient failures up to the configured
/// bound.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-transient error immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt + 1,
                        "transient error, retries exhausted"
                    );
                    return Err(e);
                }

                let delay = backoff_delay(config, attempt, &e);
                debug!(
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Computes the delay before retry number `attempt` (0-based).
///
/// An explicit server-suggested wait (429 Retry-After) takes precedence
/// over the configured base; the exponential curve is capped at
/// `max_backoff` and jittered ±25% so concurrent workers do not retry in
/// lockstep.
fn backoff_delay(config: &RetryConfig, attempt: u32, error: &GatewayError) -> Duration {
    let base = match error {
        GatewayError::RateLimited {
            retry_after: Some(delay),
        } => *delay,
        _ => config.base_backoff,
    };
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exp.min(config.max_backoff);

    let jitter_span = capped.as_millis() as f64 * 0.25;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let millis = (capped.as_millis() as f64 + jitter).max(0.0) as u64;
    Duration::from_millis(millis)
}
