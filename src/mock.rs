//! Scripted in-process transport.
//!
//! Stands in for a real HTTP adapter in the demo binary and QA tests:
//! responses play back in order, then a fallback repeats. Each response
//! carries an optional latency so scheduling behavior is observable.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::api_call::{ApiCall, CallResponse};
use crate::error::CallError;

/// One scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub latency: Duration,
}

impl MockResponse {
    /// 200 with a usage block.
    pub fn ok(total_tokens: u64) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                "usage": {"total_tokens": total_tokens},
            }),
            latency: Duration::ZERO,
        }
    }

    /// 429 with a `Retry-After` hint in seconds.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            status: 429,
            headers: HashMap::from([(
                "Retry-After".to_string(),
                retry_after_secs.to_string(),
            )]),
            body: json!({"error": {"message": "Rate limit reached for requests"}}),
            latency: Duration::ZERO,
        }
    }

    /// 429 with a quota-exhaustion body.
    pub fn quota_exhausted() -> Self {
        Self {
            status: 429,
            headers: HashMap::new(),
            body: json!({"error": {
                "message": "You exceeded your current quota, please check your plan and billing details.",
                "code": "insufficient_quota",
            }}),
            latency: Duration::ZERO,
        }
    }

    pub fn server_error(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: json!({"error": {"message": "The server had an error"}}),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// Plays back a script of responses, then repeats the fallback.
pub struct MockCall {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    calls: AtomicU32,
}

impl MockCall {
    /// Every call answers with the fallback.
    pub fn always(fallback: MockResponse) -> Self {
        Self::scripted(Vec::new(), fallback)
    }

    /// Answers from `script` in order, then the fallback.
    pub fn scripted(script: Vec<MockResponse>, fallback: MockResponse) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    /// How many calls have been made.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ApiCall for MockCall {
    async fn call(
        &self,
        _payload: &Value,
        _headers: &HashMap<String, String>,
    ) -> Result<CallResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.next_response();
        if !scripted.latency.is_zero() {
            tokio::time::sleep(scripted.latency).await;
        }
        let mut headers = scripted.headers;
        headers
            .entry("Date".to_string())
            .or_insert_with(|| Utc::now().to_rfc2822());
        Ok(CallResponse::new(scripted.status, headers, scripted.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let call = MockCall::scripted(vec![MockResponse::server_error(500)], MockResponse::ok(7));
        let first = call.call(&json!({}), &HashMap::new()).await.unwrap();
        assert_eq!(first.status, 500);
        let second = call.call(&json!({}), &HashMap::new()).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(second.usage_total_tokens(), Some(7));
        assert_eq!(call.calls(), 2);
    }

    #[tokio::test]
    async fn test_date_header_is_stamped() {
        let call = MockCall::always(MockResponse::ok(1));
        let response = call.call(&json!({}), &HashMap::new()).await.unwrap();
        assert!(response.date().is_some());
    }
}
