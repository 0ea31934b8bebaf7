// SPDX-License-Identifier: MIT
//! Exponential backoff retry for provider driver calls.
//!
//! [`retry_with_backoff`] retries a fallible provider call — `Deploy`,
//! `GetStatus`, `Cancel`, upload of a single missing digest — up to
//! [`RetryConfig::max_attempts`] times with exponentially increasing delays.
//! Specialized on [`OrchestratorError`] rather than a generic error type so
//! it can consult [`ErrorKind`] directly: a `provider_rejected` (the
//! provider understood the request and said no) or `cancelled` error is
//! never worth a second attempt, so the loop stops on the first one instead
//! of burning the rest of `max_attempts` waiting out backoff delays that
//! can't possibly help.
//!
//! # Example
//! ```rust,ignore
//! use orchd::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(&RetryConfig::default(), || async {
//!     backend.upload_file(path, digest, bytes).await
//! })
//! .await;
//! ```

use crate::error::{ErrorKind, OrchestratorError};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    ///
    /// Default: 3 — the `provider_unreachable` recovery budget (source
    /// spec §4.4).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    ///
    /// Each subsequent delay is multiplied by `multiplier`.
    /// Default: 500 ms
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    ///
    /// Default: 30 s
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    ///
    /// Default: 2.0 (doubles each time)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Create a config with a single attempt (no retries).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Whether another attempt could plausibly succeed. Only the transient
/// provider-side kinds are worth paying backoff for; everything else
/// (the provider rejected the request outright, the caller cancelled, the
/// config was invalid) will fail identically on every attempt.
fn is_retryable(err: &OrchestratorError) -> bool {
    matches!(err.kind, ErrorKind::ProviderUnreachable | ErrorKind::ProviderTimeout)
}

/// Retry a provider call with exponential backoff, short-circuiting on the
/// first non-retryable [`ErrorKind`].
///
/// Calls `f()` up to `config.max_attempts` times. On each retryable
/// failure, waits for the computed backoff delay before trying again; the
/// delay starts at `config.initial_delay` and is multiplied by
/// `config.multiplier` after each attempt, capped at `config.max_delay`. A
/// non-retryable failure (see [`is_retryable`]) returns immediately without
/// consuming the remaining attempt budget or sleeping.
///
/// Returns `Ok(result)` on the first success, or `Err(last_error)` once
/// attempts are exhausted or a non-retryable error is hit.
///
/// # Panics
/// Panics if `config.max_attempts` is 0 (would never attempt the call).
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut f: F) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
{
    assert!(config.max_attempts > 0, "RetryConfig.max_attempts must be at least 1");

    let mut delay = config.initial_delay;
    let mut last_err: Option<OrchestratorError> = None;

    for attempt in 1..=config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "provider call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                warn!(attempt, kind = %e.kind, "provider call failed with a non-retryable error");
                return Err(e);
            }
            Err(e) => {
                if attempt < config.max_attempts {
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis(),
                        kind = %e.kind,
                        "provider call failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
                } else {
                    warn!(attempt, max = config.max_attempts, kind = %e.kind, "provider call retries exhausted");
                    last_err = Some(e);
                }
            }
        }
    }

    Err(last_err.expect("retry loop ended without setting last_err"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn unreachable(detail: &str) -> OrchestratorError {
        OrchestratorError::new(ErrorKind::ProviderUnreachable, detail)
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                if n < 3 {
                    Err(unreachable(&format!("attempt {n} failed")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_all_attempts() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err(unreachable("provider down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::ProviderUnreachable);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn no_retry_config_does_one_attempt() {
        let cfg = RetryConfig::no_retry();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let _: Result<(), OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err(unreachable("fail"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn provider_rejected_is_not_retried() {
        // A 4xx-shaped rejection will fail identically every time — burning
        // the attempt budget on it would only delay the eventual failure.
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err(OrchestratorError::new(ErrorKind::ProviderRejected, "manifest malformed"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::ProviderRejected);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn delay_is_capped_at_max() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 10.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let start = std::time::Instant::now();
        let _: Result<(), OrchestratorError> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err(unreachable("fail"))
            }
        })
        .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::Relaxed), 10);
    }
}
