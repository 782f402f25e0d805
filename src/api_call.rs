//! API-call events and the transport seam.
//!
//! The executor never talks HTTP itself. Each event carries an
//! [`ApiCall`] (the asynchronous `call(payload, headers)` provided by
//! the enclosing model adapter) and interprets its [`CallResponse`] per
//! the error taxonomy:
//!
//! - 2xx with a body completes the event; a `usage.total_tokens` field
//!   and the `Date` header feed the rate limiter's reservation ledger
//! - 429 is a rate-limit rejection, honoring `Retry-After`; a quota
//!   message makes it terminal
//! - 5xx is a transient server error
//!
//! Token counting is likewise a seam: [`TokenCounter`] is pure and the
//! built-in heuristic keeps tests hermetic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::ser::SerializeStruct;
use serde_json::Value;
use tracing::warn;

use crate::config::RetryConfig;
use crate::element::{Element, ElementMeta};
use crate::error::{CallError, ConfigError, EventError};
use crate::event::{AdmissionRequest, Event, EventStatus, Execution};
use crate::id::Id;
use crate::logging::TRACE_TARGET;
use crate::rate_limiter::RateLimiter;
use crate::retry;

// ============================================================
// TRANSPORT SEAM
// ============================================================

/// What the model adapter's transport hands back for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl CallResponse {
    pub fn new(status: u16, headers: HashMap<String, String>, body: Value) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The upstream response wall-clock from the `Date` header.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        let raw = self.header("date")?;
        DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// `usage.total_tokens` from the body, when the endpoint reports it.
    pub fn usage_total_tokens(&self) -> Option<u64> {
        self.body.get("usage")?.get("total_tokens")?.as_u64()
    }

    /// Structured error code, e.g. `insufficient_quota`.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.get("code")?.as_str()
    }

    /// Best-effort human-readable error summary.
    pub fn error_message(&self) -> String {
        match self.body.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(err) => err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            None => format!("status {}", self.status),
        }
    }
}

/// Interpret a response per the taxonomy. Success passes through.
pub fn classify(response: CallResponse, now: DateTime<Utc>) -> Result<CallResponse, CallError> {
    if response.is_success() {
        return Ok(response);
    }
    match response.status {
        429 => {
            let message = response.error_message();
            // structured code first; the message substring is a fallback
            let quota = response.error_code() == Some("insufficient_quota")
                || message.to_ascii_lowercase().contains("quota");
            if quota {
                Err(CallError::QuotaExhausted { message })
            } else {
                let retry_after = response
                    .header("retry-after")
                    .and_then(|v| retry::parse_retry_after(v, now));
                Err(CallError::RateLimited {
                    requested_tokens: None,
                    retry_after,
                })
            }
        }
        status if status >= 500 => Err(CallError::Server {
            status,
            message: response.error_message(),
        }),
        status => Err(CallError::Http {
            status,
            message: response.error_message(),
        }),
    }
}

/// The asynchronous call a model adapter supplies for its endpoint.
#[async_trait]
pub trait ApiCall: Send + Sync {
    async fn call(
        &self,
        payload: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<CallResponse, CallError>;
}

// ============================================================
// TOKEN COUNTING
// ============================================================

/// Pure payload-cost function. Real tokenizers live outside this crate.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, payload: &Value) -> u64;
}

/// Deterministic fallback: serialized length divided by four.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, payload: &Value) -> u64 {
        let serialized = payload.to_string();
        (serialized.len() as u64).div_ceil(4)
    }
}

// ============================================================
// API CALL EVENT
// ============================================================

struct EventState {
    payload: Value,
    headers: HashMap<String, String>,
    request: AdmissionRequest,
    /// Opaque passthrough for upstream response caches; never
    /// interpreted here.
    cache_control: bool,
    call: Arc<dyn ApiCall>,
    retry: RetryConfig,
    limiter: Option<Arc<RateLimiter>>,
    status: Mutex<EventStatus>,
    execution: Mutex<Execution>,
    invoked: AtomicBool,
}

/// One upstream API call with a status lifecycle.
///
/// Cloning yields another handle onto the same lifecycle: the pile, the
/// processor and the in-flight task all see one status machine.
#[derive(Clone)]
pub struct ApiCallEvent {
    meta: ElementMeta,
    state: Arc<EventState>,
}

impl ApiCallEvent {
    pub fn builder(call: Arc<dyn ApiCall>) -> ApiCallEventBuilder {
        ApiCallEventBuilder {
            call,
            payload: Value::Null,
            headers: HashMap::new(),
            required_tokens: 0,
            estimated_output_tokens: 0,
            cache_control: false,
            retry: RetryConfig::default(),
            limiter: None,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.state.payload
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.state.headers
    }

    pub fn cache_control(&self) -> bool {
        self.state.cache_control
    }

    fn finish(&self, started: Instant, outcome: Result<Value, CallError>) {
        let duration = started.elapsed().as_secs_f64();
        let mut execution = self.state.execution.lock().unwrap();
        let next = match outcome {
            Ok(body) => {
                execution.response = Some(body);
                EventStatus::Completed
            }
            Err(err) => {
                execution.error = Some(err.to_string());
                EventStatus::Failed
            }
        };
        execution.duration = Some(duration);
        drop(execution);
        if let Err(err) = self.transition(next) {
            warn!(target: TRACE_TARGET, id = %self.meta.id, %err, "dropping late status transition");
        }
    }
}

impl fmt::Debug for ApiCallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCallEvent")
            .field("id", &self.meta.id)
            .field("status", &self.status())
            .field("request", &self.state.request)
            .finish()
    }
}

/// Equality is element identity.
impl PartialEq for ApiCallEvent {
    fn eq(&self, other: &Self) -> bool {
        self.meta.id == other.meta.id
    }
}

impl Element for ApiCallEvent {
    fn id(&self) -> Id {
        self.meta.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }
}

/// Observable state for UIs and tests: id, creation time, status and the
/// execution record, tagged with a `kind` discriminator.
impl Serialize for ApiCallEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut out = serializer.serialize_struct("ApiCallEvent", 5)?;
        out.serialize_field("kind", "api_call")?;
        out.serialize_field("id", &self.meta.id)?;
        out.serialize_field("created_at", &self.meta.created_at)?;
        out.serialize_field("status", &self.status())?;
        out.serialize_field("execution", &self.execution())?;
        out.end()
    }
}

#[async_trait]
impl Event for ApiCallEvent {
    fn status(&self) -> EventStatus {
        *self.state.status.lock().unwrap()
    }

    fn transition(&self, next: EventStatus) -> Result<(), EventError> {
        let mut status = self.state.status.lock().unwrap();
        *status = status.transition_to(next)?;
        Ok(())
    }

    fn request(&self) -> AdmissionRequest {
        self.state.request
    }

    fn execution(&self) -> Execution {
        self.state.execution.lock().unwrap().clone()
    }

    async fn invoke(&self) {
        if self.state.invoked.swap(true, Ordering::SeqCst) {
            warn!(target: TRACE_TARGET, id = %self.meta.id, "invoke called twice; ignoring");
            return;
        }
        // direct callers skip the processor's dispatch transition
        if self.status() == EventStatus::Pending {
            let _ = self.transition(EventStatus::Processing);
        }

        let started = Instant::now();
        let request = self.state.request;

        if let Some(limiter) = &self.state.limiter {
            if let Some((requested_tokens, limit_tokens)) = limiter.exceeds_budget(&request) {
                self.finish(
                    started,
                    Err(CallError::ExceedsBudget {
                        requested_tokens,
                        limit_tokens,
                    }),
                );
                return;
            }
        }

        let call = Arc::clone(&self.state.call);
        let payload = &self.state.payload;
        let headers = &self.state.headers;
        let limit_tokens = self.state.limiter.as_ref().and_then(|l| l.limit_tokens());

        let result = retry::invoke_with_retry_budget(&self.state.retry, limit_tokens, || {
            let call = Arc::clone(&call);
            async move {
                let response = call.call(payload, headers).await?;
                classify(response, Utc::now())
            }
        })
        .await;

        match result {
            Ok(response) => {
                if let Some(limiter) = &self.state.limiter {
                    limiter.update_from_headers(&response.headers);
                    limiter.record_completion(
                        response.date(),
                        response.usage_total_tokens(),
                        request.total(),
                    );
                }
                self.finish(started, Ok(response.body));
            }
            Err(err) => self.finish(started, Err(err)),
        }
    }

    fn fail(&self, error: String) {
        if self.status().is_terminal() {
            return;
        }
        {
            let mut execution = self.state.execution.lock().unwrap();
            execution.error = Some(error);
            execution.duration = Some(0.0);
        }
        let _ = self.transition(EventStatus::Failed);
    }
}

// ============================================================
// BUILDER
// ============================================================

pub struct ApiCallEventBuilder {
    call: Arc<dyn ApiCall>,
    payload: Value,
    headers: HashMap<String, String>,
    required_tokens: u64,
    estimated_output_tokens: u64,
    cache_control: bool,
    retry: RetryConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl ApiCallEventBuilder {
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn required_tokens(mut self, tokens: u64) -> Self {
        self.required_tokens = tokens;
        self
    }

    pub fn estimated_output_tokens(mut self, tokens: u64) -> Self {
        self.estimated_output_tokens = tokens;
        self
    }

    /// Derive `required_tokens` from the payload with a counter.
    pub fn count_required_tokens(mut self, counter: &dyn TokenCounter) -> Self {
        self.required_tokens = counter.count_tokens(&self.payload);
        self
    }

    pub fn cache_control(mut self, enabled: bool) -> Self {
        self.cache_control = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<ApiCallEvent, ConfigError> {
        self.retry.validate()?;
        Ok(ApiCallEvent {
            meta: ElementMeta::new(),
            state: Arc::new(EventState {
                payload: self.payload,
                headers: self.headers,
                request: AdmissionRequest {
                    required_tokens: self.required_tokens,
                    estimated_output_tokens: self.estimated_output_tokens,
                },
                cache_control: self.cache_control,
                call: self.call,
                retry: self.retry,
                limiter: self.limiter,
                status: Mutex::new(EventStatus::Pending),
                execution: Mutex::new(Execution::default()),
                invoked: AtomicBool::new(false),
            }),
        })
    }
}
