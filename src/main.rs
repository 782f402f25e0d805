//! flowgate - Rate-gated asynchronous action executor
//!
//! Demo entry point: wires config, logging and an executor against the
//! scripted mock transport.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌───────────┐    ┌──────────┐
//! │  Config  │───▶│ Executor │───▶│ Processor │───▶│ Journal  │
//! │  (YAML)  │    │ (append) │    │ (dispatch)│    │  (JSON)  │
//! └──────────┘    └──────────┘    └───────────┘    └──────────┘
//! ```
//!
//! Pass a YAML config path as the first argument, otherwise defaults
//! apply. The script exercises a success burst, a 429 with Retry-After,
//! and a quota exhaustion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use flowgate::config::AppConfig;
use flowgate::executor::Executor;
use flowgate::journal::{Journal, JournalRecord};
use flowgate::logging::{TRACE_TARGET, init_logging};
use flowgate::mock::{MockCall, MockResponse};
use flowgate::{ApiCallEvent, HeuristicTokenCounter, TokenCounter};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };
    // demo-friendly budgets unless a config file says otherwise
    if config.executor.limit_requests.is_none() {
        config.executor.limit_requests = Some(5);
        config.executor.limit_tokens = Some(10_000);
        config.executor.interval = Some(10.0);
        config.executor.queue_capacity = 8;
        config.executor.capacity_refresh_time = 0.2;
    }

    let _guard = init_logging(&config);
    tracing::info!(target: TRACE_TARGET, "starting demo run");

    let executor: Executor<ApiCallEvent> = Executor::new(config.executor.clone())?;
    let journal = Journal::new(config.journal.clone())?;
    let counter = HeuristicTokenCounter;

    // one transport per endpoint persona
    let steady = Arc::new(MockCall::always(
        MockResponse::ok(120).with_latency(Duration::from_millis(40)),
    ));
    let flaky = Arc::new(MockCall::scripted(
        vec![MockResponse::rate_limited(1)],
        MockResponse::ok(80).with_latency(Duration::from_millis(25)),
    ));
    let broke = Arc::new(MockCall::always(MockResponse::quota_exhausted()));

    let mut events = Vec::new();
    for i in 0..4 {
        let payload = json!({
            "model": "demo-model",
            "messages": [{"role": "user", "content": format!("say hello #{i}")}],
        });
        let required = counter.count_tokens(&payload);
        let mut builder = ApiCallEvent::builder(steady.clone())
            .payload(payload)
            .required_tokens(required)
            .estimated_output_tokens(64)
            .retry(config.retry);
        if let Some(limiter) = executor.limiter() {
            builder = builder.limiter(limiter);
        }
        events.push(builder.build()?);
    }

    let payload = json!({"model": "demo-model", "messages": [{"role": "user", "content": "rate limited once"}]});
    let mut builder = ApiCallEvent::builder(flaky.clone())
        .required_tokens(counter.count_tokens(&payload))
        .payload(payload)
        .estimated_output_tokens(64)
        .retry(config.retry);
    if let Some(limiter) = executor.limiter() {
        builder = builder.limiter(limiter);
    }
    events.push(builder.build()?);

    let payload = json!({"model": "demo-model", "messages": [{"role": "user", "content": "doomed"}]});
    let mut builder = ApiCallEvent::builder(broke.clone())
        .required_tokens(counter.count_tokens(&payload))
        .payload(payload)
        .retry(config.retry);
    if let Some(limiter) = executor.limiter() {
        builder = builder.limiter(limiter);
    }
    events.push(builder.build()?);

    executor.start().await?;
    for event in &events {
        executor.append(event.clone()).await;
    }
    let drained = executor.drain(Duration::from_secs(30)).await?;
    executor.stop().await;

    for event in &events {
        journal.record(JournalRecord::of("api_call", event));
    }
    if let Some(path) = journal.shutdown()? {
        tracing::info!(target: TRACE_TARGET, path = %path.display(), "journal written");
    }

    let completed = executor.completed_events().await.len().await;
    let failed = executor.failed_events().await.len().await;
    println!("{}", executor.stats());
    println!(
        "drained={drained} completed={completed} failed={failed} steady_calls={} flaky_calls={} broke_calls={}",
        steady.calls(),
        flaky.calls(),
        broke.calls()
    );

    if let Some(limiter) = executor.limiter() {
        println!(
            "limiter: available_requests={:?} available_tokens={:?} unreleased={}",
            limiter.available_requests(),
            limiter.available_tokens(),
            limiter.unreleased_len()
        );
    }

    Ok(())
}
