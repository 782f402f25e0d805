//! Independent end-to-end QA for the executor pipeline.
//!
//! Every scenario runs on the paused tokio clock so wall-clock
//! assertions (replenishment after 60s, Retry-After sleeps, backoff
//! sums) are exact and fast.

use std::sync::Arc;
use std::time::Duration;

use flowgate::executor::Executor;
use flowgate::mock::{MockCall, MockResponse};
use flowgate::{
    ApiCallEvent, Element, Event, EventStatus, ExecutorConfig, ProcessorState, RetryConfig,
};

/// The scenario config used throughout: 5 requests / 100 tokens per
/// 60s interval, queue of 5.
fn burst_config() -> ExecutorConfig {
    ExecutorConfig {
        queue_capacity: 5,
        capacity_refresh_time: 0.05,
        interval: Some(60.0),
        limit_requests: Some(5),
        limit_tokens: Some(100),
        concurrency_limit: None,
    }
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay: 0.1,
        max_delay: 60.0,
    }
}

/// Build an event costing `required + estimated` tokens against the
/// executor's limiter.
fn event_on(
    executor: &Executor<ApiCallEvent>,
    call: Arc<MockCall>,
    required: u64,
    estimated: u64,
) -> ApiCallEvent {
    let mut builder = ApiCallEvent::builder(call)
        .payload(serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}))
        .required_tokens(required)
        .estimated_output_tokens(estimated)
        .retry(quick_retry());
    if let Some(limiter) = executor.limiter() {
        builder = builder.limiter(limiter);
    }
    builder.build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn qa_burst_within_capacity() {
    // Five events, 10 tokens each, inside a 5-request / 100-token budget:
    // everything completes in one cycle.
    let executor: Executor<ApiCallEvent> = Executor::new(burst_config()).unwrap();
    let call = Arc::new(MockCall::always(
        MockResponse::ok(10).with_latency(Duration::from_millis(10)),
    ));

    let events: Vec<ApiCallEvent> =
        (0..5).map(|_| event_on(&executor, call.clone(), 5, 5)).collect();
    executor.start().await.unwrap();
    for e in &events {
        executor.append(e.clone()).await;
    }
    executor.forward().await.unwrap();
    assert!(executor.drain(Duration::from_secs(5)).await.unwrap());

    for e in &events {
        assert_eq!(e.status(), EventStatus::Completed);
    }
    assert_eq!(call.calls(), 5);

    // budget fully spent before replenishment
    let limiter = executor.limiter().unwrap();
    assert_eq!(limiter.available_requests(), Some(0));
    assert_eq!(limiter.available_tokens(), Some(50));

    // one interval later the replenisher restores both gauges
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(limiter.available_requests(), Some(5));
    assert_eq!(limiter.available_tokens(), Some(100));
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_burst_exceeding_capacity() {
    // Seven events against a budget of five: five dispatch now, two wait
    // for the replenisher.
    let executor: Executor<ApiCallEvent> = Executor::new(burst_config()).unwrap();
    let call = Arc::new(MockCall::always(
        MockResponse::ok(10).with_latency(Duration::from_millis(10)),
    ));

    let events: Vec<ApiCallEvent> =
        (0..7).map(|_| event_on(&executor, call.clone(), 5, 5)).collect();
    executor.start().await.unwrap();
    for e in &events {
        executor.append(e.clone()).await;
    }
    executor.forward().await.unwrap();

    // give the first wave a beat to finish, well inside the interval
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(executor.completed_events().await.len().await, 5);
    assert_eq!(executor.pending_events().await.len().await, 2);

    // after the interval the replenisher restores request capacity and
    // the execute loop drains the remainder
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(executor.drain(Duration::from_secs(10)).await.unwrap());
    assert_eq!(executor.completed_events().await.len().await, 7);
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_retry_after_hint_is_honored() {
    // 429 with Retry-After: 2, then success: two calls, at least two
    // seconds of wall time.
    let executor: Executor<ApiCallEvent> = Executor::new(ExecutorConfig {
        queue_capacity: 2,
        capacity_refresh_time: 0.05,
        ..Default::default()
    })
    .unwrap();
    let call = Arc::new(MockCall::scripted(
        vec![MockResponse::rate_limited(2)],
        MockResponse::ok(10),
    ));
    let event = event_on(&executor, call.clone(), 5, 5);

    let started = tokio::time::Instant::now();
    executor.append(event.clone()).await;
    executor.forward().await.unwrap();

    assert_eq!(event.status(), EventStatus::Completed);
    assert_eq!(call.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_quota_exhaustion_is_terminal() {
    // A quota-style 429 fails after a single call; the error mentions
    // the quota.
    let executor: Executor<ApiCallEvent> = Executor::new(ExecutorConfig {
        queue_capacity: 2,
        capacity_refresh_time: 0.05,
        ..Default::default()
    })
    .unwrap();
    let call = Arc::new(MockCall::always(MockResponse::quota_exhausted()));
    let event = event_on(&executor, call.clone(), 5, 5);

    executor.append(event.clone()).await;
    executor.forward().await.unwrap();

    assert_eq!(event.status(), EventStatus::Failed);
    assert_eq!(call.calls(), 1);
    let error = event.execution().error.unwrap();
    assert!(error.to_lowercase().contains("quota"));
    assert!(executor.failed_events().await.contains(&event.id()).await);
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_request_exceeding_budget_never_calls() {
    // required 80 + estimated 50 against a 100-token budget: failed
    // before the transport is ever touched.
    let executor: Executor<ApiCallEvent> = Executor::new(burst_config()).unwrap();
    let call = Arc::new(MockCall::always(MockResponse::ok(10)));
    let event = event_on(&executor, call.clone(), 80, 50);

    executor.append(event.clone()).await;
    executor.forward().await.unwrap();

    assert_eq!(event.status(), EventStatus::Failed);
    assert_eq!(call.calls(), 0);
    let error = event.execution().error.unwrap();
    assert!(error.contains("budget"));
    assert!(error.contains("130"));
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_graceful_stop_finishes_in_flight() {
    // Five 500ms calls in flight; stop after 100ms: all five complete,
    // nothing new dispatches, the processor ends STOPPED.
    let executor: Arc<Executor<ApiCallEvent>> = Arc::new(
        Executor::new(ExecutorConfig {
            queue_capacity: 8,
            capacity_refresh_time: 0.05,
            ..Default::default()
        })
        .unwrap(),
    );
    let call = Arc::new(MockCall::always(
        MockResponse::ok(10).with_latency(Duration::from_millis(500)),
    ));
    let events: Vec<ApiCallEvent> =
        (0..5).map(|_| event_on(&executor, call.clone(), 5, 5)).collect();

    executor.start().await.unwrap();
    for e in &events {
        executor.append(e.clone()).await;
    }
    let forwarder = Arc::clone(&executor);
    let forward_task = tokio::spawn(async move { forwarder.forward().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.stop().await;
    forward_task.await.unwrap().unwrap();

    for e in &events {
        assert_eq!(e.status(), EventStatus::Completed);
    }
    assert_eq!(executor.processor_state().await, Some(ProcessorState::Stopped));

    // appended after stop: stored, never dispatched
    let late = event_on(&executor, call.clone(), 5, 5);
    executor.append(late.clone()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(late.status(), EventStatus::Pending);
    assert_eq!(call.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn qa_queue_capacity_one_serializes_dispatch() {
    // queue_capacity = 1 also caps concurrency at 1: ten 50ms calls take
    // at least 500ms end to end.
    let executor: Executor<ApiCallEvent> = Executor::new(ExecutorConfig {
        queue_capacity: 1,
        capacity_refresh_time: 0.01,
        ..Default::default()
    })
    .unwrap();
    let call = Arc::new(MockCall::always(
        MockResponse::ok(10).with_latency(Duration::from_millis(50)),
    ));
    let events: Vec<ApiCallEvent> =
        (0..10).map(|_| event_on(&executor, call.clone(), 1, 0)).collect();

    executor.start().await.unwrap();
    let started = tokio::time::Instant::now();
    for e in &events {
        executor.append(e.clone()).await;
    }
    assert!(executor.drain(Duration::from_secs(30)).await.unwrap());

    for e in &events {
        assert_eq!(e.status(), EventStatus::Completed);
    }
    assert!(started.elapsed() >= Duration::from_millis(500));
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_request_only_limiting_ignores_tokens() {
    // limit_tokens absent: token cost never blocks, requests still do.
    let executor: Executor<ApiCallEvent> = Executor::new(ExecutorConfig {
        queue_capacity: 4,
        capacity_refresh_time: 0.05,
        interval: Some(60.0),
        limit_requests: Some(3),
        limit_tokens: None,
        concurrency_limit: None,
    })
    .unwrap();
    let call = Arc::new(MockCall::always(MockResponse::ok(10)));
    let events: Vec<ApiCallEvent> = (0..3)
        .map(|_| event_on(&executor, call.clone(), 1_000_000, 1_000_000))
        .collect();

    executor.start().await.unwrap();
    for e in &events {
        executor.append(e.clone()).await;
    }
    executor.forward().await.unwrap();

    for e in &events {
        assert_eq!(e.status(), EventStatus::Completed);
    }
    assert_eq!(executor.limiter().unwrap().available_requests(), Some(0));
    executor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn qa_failed_events_stay_addressable() {
    // A failed event is still in the pile with its error summary; the
    // caller polls rather than catching anything.
    let executor: Executor<ApiCallEvent> = Executor::new(ExecutorConfig {
        queue_capacity: 2,
        capacity_refresh_time: 0.05,
        ..Default::default()
    })
    .unwrap();
    let call = Arc::new(MockCall::always(MockResponse::server_error(500)));
    let event = event_on(&executor, call, 1, 0);

    executor.append(event.clone()).await;
    executor.forward().await.unwrap();

    let stored = executor.pile().get(&event.id()).await.unwrap();
    assert_eq!(stored.status(), EventStatus::Failed);
    let execution = stored.execution();
    assert!(execution.error.unwrap().contains("4 attempts"));
    assert!(execution.duration.is_some());
    executor.stop().await;
}
