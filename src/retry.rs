//! Retry wrapper for upstream invocations.
//!
//! Wraps an awaitable call with bounded, deterministic retries:
//!
//! - exponential backoff `min(base_delay * 2^attempt, max_delay)`, no
//!   jitter, so tests can assert exact sleep totals
//! - a server `Retry-After` hint overrides the exponential schedule for
//!   that attempt (clamped to `max_delay`) without advancing it
//! - terminal kinds (quota exhausted, over budget, cancelled) fail
//!   immediately
//! - a rate-limit rejection whose requested tokens can never fit the
//!   static token budget fails immediately as a budget error
//! - after `max_retries` failed retries the last cause is wrapped in
//!   [`CallError::RetryExhausted`] citing the attempt count
//!
//! The wrapped call runs at most `max_retries + 1` times.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::CallError;
use crate::logging::TRACE_TARGET;

/// Run `op` under the retry policy.
pub async fn invoke_with_retry<F, Fut, T>(config: &RetryConfig, op: F) -> Result<T, CallError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    invoke_with_retry_budget(config, None, op).await
}

/// Run `op` under the retry policy, converting rate-limit rejections that
/// can never fit `limit_tokens` into immediate budget failures.
pub async fn invoke_with_retry_budget<F, Fut, T>(
    config: &RetryConfig,
    limit_tokens: Option<u64>,
    op: F,
) -> Result<T, CallError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let total_attempts = config.max_retries + 1;
    let mut backoff_attempt: u32 = 0;

    for call_index in 1..=total_attempts {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let CallError::RateLimited {
            requested_tokens: Some(requested),
            ..
        } = &err
        {
            if let Some(limit) = limit_tokens {
                if *requested > limit {
                    return Err(CallError::ExceedsBudget {
                        requested_tokens: *requested,
                        limit_tokens: limit,
                    });
                }
            }
        }

        if !err.is_retryable() {
            return Err(err);
        }

        if call_index == total_attempts {
            return Err(CallError::RetryExhausted {
                attempts: total_attempts,
                source: Box::new(err),
            });
        }

        let delay = match &err {
            CallError::RateLimited {
                retry_after: Some(hint),
                ..
            } => {
                // server hint; leave the exponential schedule untouched
                (*hint).min(config.max_delay_duration())
            }
            _ => {
                let delay = config.backoff_delay(backoff_attempt);
                backoff_attempt += 1;
                delay
            }
        };

        debug!(
            target: TRACE_TARGET,
            attempt = call_index,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        sleep(delay).await;
    }

    unreachable!("loop returns on the final attempt")
}

/// Parse a `Retry-After` header value: either delta-seconds or an
/// HTTP-date, measured against `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs >= 0.0 && secs.is_finite() {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_retries: u32, base_delay: f64, max_delay: f64) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    fn transient() -> CallError {
        CallError::Server {
            status: 503,
            message: "overloaded".into(),
        }
    }

    /// Counter-driven op: fails the first `failures` calls, then succeeds
    /// with the call number.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, CallError>> + Send>> + use<> {
        let counter = calls.clone();
        move || {
            let calls = counter.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures { Err(transient()) } else { Ok(n) }
            })
        }
    }

    #[tokio::test]
    async fn test_first_success_makes_one_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = invoke_with_retry(&config(3, 1.0, 60.0), flaky(&calls, 0))
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sum_for_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        let result = invoke_with_retry(&config(5, 1.0, 60.0), flaky(&calls, 3))
            .await
            .unwrap();
        assert_eq!(result, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1 + 2 + 4 seconds of deterministic backoff
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_caps_each_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        invoke_with_retry(&config(5, 10.0, 15.0), flaky(&calls, 3))
            .await
            .unwrap();
        // 10 + 15 + 15, the 20s and 40s steps are clamped
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_at_most_max_retries_plus_one_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = invoke_with_retry(&config(2, 0.001, 0.001), move || {
            let calls = counter.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            CallError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, CallError::Server { status: 503, .. }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();
        let result = invoke_with_retry(&config(3, 1.0, 60.0), move || {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                match n {
                    1 => Err(CallError::RateLimited {
                        requested_tokens: None,
                        retry_after: Some(Duration::from_secs(3)),
                    }),
                    // hinted sleep must not have advanced the schedule:
                    // this failure still gets the base 1s step
                    2 => Err(transient()),
                    _ => Ok(n),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_clamped_to_max_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();
        invoke_with_retry(&config(2, 1.0, 5.0), move || {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Err(CallError::RateLimited {
                        requested_tokens: None,
                        retry_after: Some(Duration::from_secs(120)),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = invoke_with_retry(&config(5, 0.001, 1.0), move || {
            let calls = counter.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::QuotaExhausted {
                    message: "You exceeded your current quota".into(),
                })
            }
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            CallError::QuotaExhausted { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_over_budget_rate_limit_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> =
            invoke_with_retry_budget(&config(5, 0.001, 1.0), Some(100), move || {
                let calls = counter.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::RateLimited {
                        requested_tokens: Some(130),
                        retry_after: None,
                    })
                }
            })
            .await;
        match result.unwrap_err() {
            CallError::ExceedsBudget {
                requested_tokens,
                limit_tokens,
            } => {
                assert_eq!(requested_tokens, 130);
                assert_eq!(limit_tokens, 100);
            }
            other => panic!("expected ExceedsBudget, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_budget_rate_limit_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = invoke_with_retry_budget(&config(3, 1.0, 60.0), Some(1000), move || {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Err(CallError::RateLimited {
                        requested_tokens: Some(130),
                        retry_after: None,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(
            parse_retry_after("3", now),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            parse_retry_after(" 2.5 ", now),
            Some(Duration::from_secs_f64(2.5))
        );
        assert_eq!(parse_retry_after("-1", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let parsed = parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now);
        assert_eq!(parsed, Some(Duration::from_secs(30)));
        // dates in the past yield nothing
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now),
            None
        );
    }
}
