//! Request and token budget accounting.
//!
//! One limiter per endpoint, shared by every event the processor
//! dispatches there. Capacity is tracked on two axes, either of which may
//! be unbounded:
//!
//! - **requests**: whole admissions per interval
//! - **tokens**: prompt + estimated completion tokens per interval
//!
//! Two update paths feed the same gauges:
//!
//! 1. *Reservation ledger*: every completed call appends a reservation
//!    `(timestamp, token_usage)`; once a reservation is older than the
//!    interval its capacity is returned exactly once.
//! 2. *Interval reset*: the processor's replenisher task periodically
//!    resets the gauges wholesale, counting queued work against the
//!    request budget.
//!
//! Response headers (`x-ratelimit-*`) reconcile the local view downward
//! when the server's view is tighter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::ConfigError;
use crate::event::AdmissionRequest;
use crate::logging::TRACE_TARGET;

// ============================================================
// RESERVATION LEDGER
// ============================================================

/// A completed call still holding capacity.
///
/// `timestamp` is the upstream response wall-clock (the `Date` header
/// when available). `token_usage` is the observed total cost, falling
/// back to the admission-time estimate when the response carried no
/// usage block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub timestamp: DateTime<Utc>,
    pub token_usage: u64,
}

#[derive(Debug, Default)]
struct Gauges {
    available_requests: u64,
    available_tokens: u64,
    unreleased: VecDeque<Reservation>,
}

// ============================================================
// RATE LIMITER
// ============================================================

/// Tracks available requests and tokens for one endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    limit_requests: Option<u64>,
    limit_tokens: Option<u64>,
    interval: Duration,
    gauges: Mutex<Gauges>,
}

impl RateLimiter {
    /// Build a limiter. Either limit may be `None`, meaning that
    /// dimension is unbounded. A non-positive interval is rejected.
    pub fn new(
        limit_requests: Option<u64>,
        limit_tokens: Option<u64>,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval(interval.as_secs_f64()));
        }
        Ok(Self {
            limit_requests,
            limit_tokens,
            interval,
            gauges: Mutex::new(Gauges {
                available_requests: limit_requests.unwrap_or(0),
                available_tokens: limit_tokens.unwrap_or(0),
                unreleased: VecDeque::new(),
            }),
        })
    }

    /// Build from the executor configuration.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.limit_requests,
            config.limit_tokens,
            config.effective_interval(),
        )
    }

    pub fn limit_requests(&self) -> Option<u64> {
        self.limit_requests
    }

    pub fn limit_tokens(&self) -> Option<u64> {
        self.limit_tokens
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Live request capacity; `None` when the axis is unbounded.
    pub fn available_requests(&self) -> Option<u64> {
        self.limit_requests?;
        Some(self.gauges.lock().unwrap().available_requests)
    }

    /// Live token capacity; `None` when the axis is unbounded.
    pub fn available_tokens(&self) -> Option<u64> {
        self.limit_tokens?;
        Some(self.gauges.lock().unwrap().available_tokens)
    }

    /// Reservations not yet released.
    pub fn unreleased_len(&self) -> usize {
        self.gauges.lock().unwrap().unreleased.len()
    }

    /// True when the request could fit within both budgets right now.
    pub fn check_availability(&self, request_tokens: u64, estimated_output_tokens: u64) -> bool {
        let gauges = self.gauges.lock().unwrap();
        Self::check_locked(
            &gauges,
            self.limit_requests,
            self.limit_tokens,
            request_tokens + estimated_output_tokens,
        )
    }

    fn check_locked(
        gauges: &Gauges,
        limit_requests: Option<u64>,
        limit_tokens: Option<u64>,
        total_tokens: u64,
    ) -> bool {
        let requests_ok = limit_requests.is_none() || gauges.available_requests >= 1;
        let tokens_ok = limit_tokens.is_none() || gauges.available_tokens >= total_tokens;
        requests_ok && tokens_ok
    }

    /// Subtract one request and the token estimate from the gauges.
    ///
    /// Callers must have observed `check_availability == true` first;
    /// skipping that can starve the caller but never corrupts counters.
    pub fn reserve(&self, request_tokens: u64, estimated_output_tokens: u64) {
        let mut gauges = self.gauges.lock().unwrap();
        if self.limit_requests.is_some() {
            gauges.available_requests = gauges.available_requests.saturating_sub(1);
        }
        if self.limit_tokens.is_some() {
            gauges.available_tokens = gauges
                .available_tokens
                .saturating_sub(request_tokens + estimated_output_tokens);
        }
    }

    /// Return capacity held by reservations older than the interval.
    ///
    /// Runs in O(size of the expired prefix); newer entries stay put.
    pub fn release_expired(&self, now: DateTime<Utc>) {
        let mut gauges = self.gauges.lock().unwrap();
        self.release_expired_locked(&mut gauges, now);
    }

    fn release_expired_locked(&self, gauges: &mut Gauges, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::seconds(60));
        while let Some(front) = gauges.unreleased.front() {
            if front.timestamp > cutoff {
                break;
            }
            let reservation = gauges.unreleased.pop_front().expect("front exists");
            if let Some(limit) = self.limit_requests {
                gauges.available_requests = (gauges.available_requests + 1).min(limit);
            }
            if let Some(limit) = self.limit_tokens {
                gauges.available_tokens =
                    (gauges.available_tokens + reservation.token_usage).min(limit);
            }
        }
    }

    /// The admission predicate: release expired holds, then check and, if
    /// admitted, reserve, all under one lock acquisition.
    pub fn try_acquire(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> bool {
        let mut gauges = self.gauges.lock().unwrap();
        self.release_expired_locked(&mut gauges, now);
        if !Self::check_locked(
            &gauges,
            self.limit_requests,
            self.limit_tokens,
            request.total(),
        ) {
            return false;
        }
        if self.limit_requests.is_some() {
            gauges.available_requests = gauges.available_requests.saturating_sub(1);
        }
        if self.limit_tokens.is_some() {
            gauges.available_tokens = gauges.available_tokens.saturating_sub(request.total());
        }
        true
    }

    /// A request whose static cost can never fit the token budget.
    ///
    /// Such an event would spin in the queue forever; the caller surfaces
    /// it as a budget error instead.
    pub fn exceeds_budget(&self, request: &AdmissionRequest) -> Option<(u64, u64)> {
        let limit = self.limit_tokens?;
        (request.total() > limit).then_some((request.total(), limit))
    }

    /// Record a completed call in the reservation ledger and correct the
    /// token gauge by the difference between the estimate and what the
    /// upstream actually charged.
    pub fn record_completion(
        &self,
        response_time: Option<DateTime<Utc>>,
        token_usage: Option<u64>,
        estimated_total: u64,
    ) {
        let mut gauges = self.gauges.lock().unwrap();
        let usage = token_usage.unwrap_or(estimated_total);
        gauges.unreleased.push_back(Reservation {
            timestamp: response_time.unwrap_or_else(Utc::now),
            token_usage: usage,
        });
        if let (Some(limit), Some(actual)) = (self.limit_tokens, token_usage) {
            if actual != estimated_total {
                // estimate already subtracted at reservation time
                let corrected = gauges
                    .available_tokens
                    .saturating_add(estimated_total)
                    .saturating_sub(actual)
                    .min(limit);
                gauges.available_tokens = corrected;
            }
        }
    }

    /// Reconcile the local view against `x-ratelimit-*` response headers.
    ///
    /// A server-advertised limit smaller than the configured one is
    /// warned about; a server-observed remaining count smaller than the
    /// local gauge pulls the gauge down.
    pub fn update_from_headers(&self, headers: &HashMap<String, String>) {
        if let (Some(server), Some(local)) = (
            header_u64(headers, "x-ratelimit-limit-requests"),
            self.limit_requests,
        ) {
            if server < local {
                warn!(
                    target: TRACE_TARGET,
                    server, local,
                    "server request limit is below the configured limit"
                );
            }
        }
        if let (Some(server), Some(local)) = (
            header_u64(headers, "x-ratelimit-limit-tokens"),
            self.limit_tokens,
        ) {
            if server < local {
                warn!(
                    target: TRACE_TARGET,
                    server, local,
                    "server token limit is below the configured limit"
                );
            }
        }

        let mut gauges = self.gauges.lock().unwrap();
        if self.limit_requests.is_some() {
            if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining-requests") {
                if remaining < gauges.available_requests {
                    debug!(
                        target: TRACE_TARGET,
                        remaining, local = gauges.available_requests,
                        "reconciling request gauge down to the server's view"
                    );
                    gauges.available_requests = remaining;
                }
            }
        }
        if self.limit_tokens.is_some() {
            if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining-tokens") {
                if remaining < gauges.available_tokens {
                    debug!(
                        target: TRACE_TARGET,
                        remaining, local = gauges.available_tokens,
                        "reconciling token gauge down to the server's view"
                    );
                    gauges.available_tokens = remaining;
                }
            }
        }
    }

    /// Wholesale reset used by the replenisher task: the request gauge is
    /// refilled minus the work already sitting in the queue, the token
    /// gauge is refilled completely.
    pub fn replenish(&self, queued: usize) {
        let mut gauges = self.gauges.lock().unwrap();
        if let Some(limit) = self.limit_requests {
            gauges.available_requests = limit.saturating_sub(queued as u64);
        }
        if let Some(limit) = self.limit_tokens {
            gauges.available_tokens = limit;
        }
    }
}

fn header_u64(headers: &HashMap<String, String>, name: &str) -> Option<u64> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: Option<u64>, tokens: Option<u64>) -> RateLimiter {
        RateLimiter::new(requests, tokens, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(matches!(
            RateLimiter::new(Some(10), None, Duration::ZERO),
            Err(ConfigError::NonPositiveInterval(_))
        ));
    }

    #[test]
    fn test_initial_capacity_equals_limits() {
        let rl = limiter(Some(5), Some(100));
        assert_eq!(rl.available_requests(), Some(5));
        assert_eq!(rl.available_tokens(), Some(100));
    }

    #[test]
    fn test_unbounded_axes_report_none() {
        let rl = limiter(None, None);
        assert_eq!(rl.available_requests(), None);
        assert_eq!(rl.available_tokens(), None);
        assert!(rl.check_availability(1_000_000, 1_000_000));
    }

    #[test]
    fn test_check_availability_both_axes() {
        let rl = limiter(Some(1), Some(100));
        assert!(rl.check_availability(60, 40));
        assert!(!rl.check_availability(60, 41));
        rl.reserve(60, 40);
        assert!(!rl.check_availability(1, 0)); // requests exhausted
    }

    #[test]
    fn test_requests_only_limiting() {
        let rl = limiter(Some(2), None);
        assert!(rl.check_availability(10_000, 10_000));
        rl.reserve(0, 0);
        rl.reserve(0, 0);
        assert!(!rl.check_availability(0, 0));
    }

    #[test]
    fn test_release_expired_exactly_once() {
        let rl = limiter(Some(10), Some(1000));
        rl.reserve(100, 0);
        let t0 = Utc::now();
        rl.record_completion(Some(t0), Some(100), 100);
        assert_eq!(rl.available_tokens(), Some(900));
        assert_eq!(rl.available_requests(), Some(9));

        // within the interval: nothing released
        rl.release_expired(t0 + chrono::Duration::seconds(30));
        assert_eq!(rl.available_tokens(), Some(900));
        assert_eq!(rl.unreleased_len(), 1);

        // past the interval: released once
        rl.release_expired(t0 + chrono::Duration::seconds(61));
        assert_eq!(rl.available_tokens(), Some(1000));
        assert_eq!(rl.available_requests(), Some(10));
        assert_eq!(rl.unreleased_len(), 0);

        // a second pass finds nothing to release
        rl.release_expired(t0 + chrono::Duration::seconds(120));
        assert_eq!(rl.available_tokens(), Some(1000));
        assert_eq!(rl.available_requests(), Some(10));
    }

    #[test]
    fn test_release_keeps_newer_entries() {
        let rl = limiter(Some(10), Some(1000));
        let t0 = Utc::now();
        rl.reserve(100, 0);
        rl.record_completion(Some(t0), Some(100), 100);
        rl.reserve(200, 0);
        rl.record_completion(Some(t0 + chrono::Duration::seconds(50)), Some(200), 200);

        rl.release_expired(t0 + chrono::Duration::seconds(61));
        assert_eq!(rl.unreleased_len(), 1);
        assert_eq!(rl.available_tokens(), Some(800)); // only the first came back
    }

    #[test]
    fn test_record_completion_corrects_estimate() {
        let rl = limiter(None, Some(1000));
        rl.reserve(100, 100); // estimate 200
        assert_eq!(rl.available_tokens(), Some(800));
        // actual charge was 150, so 50 comes back
        rl.record_completion(Some(Utc::now()), Some(150), 200);
        assert_eq!(rl.available_tokens(), Some(850));
    }

    #[test]
    fn test_record_completion_without_usage_keeps_estimate() {
        let rl = limiter(Some(10), Some(1000));
        rl.reserve(100, 100);
        rl.record_completion(Some(Utc::now()), None, 200);
        assert_eq!(rl.available_tokens(), Some(800));
        assert_eq!(rl.unreleased_len(), 1);
    }

    #[test]
    fn test_try_acquire_reserves_atomically() {
        let rl = limiter(Some(1), Some(100));
        let req = AdmissionRequest {
            required_tokens: 40,
            estimated_output_tokens: 10,
        };
        assert!(rl.try_acquire(&req, Utc::now()));
        assert_eq!(rl.available_requests(), Some(0));
        assert_eq!(rl.available_tokens(), Some(50));
        assert!(!rl.try_acquire(&req, Utc::now()));
    }

    #[test]
    fn test_exceeds_budget() {
        let rl = limiter(None, Some(100));
        let req = AdmissionRequest {
            required_tokens: 80,
            estimated_output_tokens: 50,
        };
        assert_eq!(rl.exceeds_budget(&req), Some((130, 100)));
        let fits = AdmissionRequest {
            required_tokens: 80,
            estimated_output_tokens: 20,
        };
        assert_eq!(rl.exceeds_budget(&fits), None);
        let unbounded = limiter(Some(5), None);
        assert_eq!(unbounded.exceeds_budget(&req), None);
    }

    #[test]
    fn test_headers_reconcile_downward_only() {
        let rl = limiter(Some(10), Some(1000));
        let headers = HashMap::from([
            ("X-RateLimit-Remaining-Requests".to_string(), "3".to_string()),
            ("x-ratelimit-remaining-tokens".to_string(), "400".to_string()),
        ]);
        rl.update_from_headers(&headers);
        assert_eq!(rl.available_requests(), Some(3));
        assert_eq!(rl.available_tokens(), Some(400));

        // a looser server view never raises the gauges
        let headers = HashMap::from([(
            "x-ratelimit-remaining-requests".to_string(),
            "9999".to_string(),
        )]);
        rl.update_from_headers(&headers);
        assert_eq!(rl.available_requests(), Some(3));
    }

    #[test]
    fn test_replenish_counts_queued_work() {
        let rl = limiter(Some(5), Some(100));
        rl.reserve(50, 0);
        rl.reserve(30, 0);
        assert_eq!(rl.available_requests(), Some(3));
        assert_eq!(rl.available_tokens(), Some(20));

        rl.replenish(2);
        assert_eq!(rl.available_requests(), Some(3)); // 5 - 2 queued
        assert_eq!(rl.available_tokens(), Some(100));

        rl.replenish(0);
        assert_eq!(rl.available_requests(), Some(5));
    }
}
