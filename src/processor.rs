//! Processor - capacity-gated event dispatch.
//!
//! The processor consumes events from a bounded queue and launches each
//! admitted invocation as a concurrent task:
//!
//! ```text
//! ┌──────────┐  enqueue   ┌─────────────┐  admitted   ┌─────────────┐
//! │ Executor │ ─────────▶ │  Processor  │ ──────────▶ │ invoke task │
//! │ .forward │            │  (process)  │             │ (semaphore) │
//! └──────────┘            └──────┬──────┘             └─────────────┘
//!                                │ denied
//!                                ▼
//!                         holdback slot, re-examined
//!                         after capacity_refresh_time
//! ```
//!
//! # Key Design
//!
//! - **FIFO with head-of-line holdback**: a denied head is retained in a
//!   holdback slot and re-examined before any newer event is dequeued.
//! - **Per-cycle budget**: at most `queue_capacity` events are examined
//!   per cycle; the budget is reset after the in-flight set is awaited.
//! - **Cooperative shutdown**: `stop()` prevents new dequeues; in-flight
//!   invocations always run to completion.
//! - **Replenisher**: with a rate limiter attached, a background task
//!   resets the budget gauges every `interval`, counting queued work
//!   against the request budget so it is not admitted twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::element::Element;
use crate::error::ConfigError;
use crate::event::{Event, EventStatus};
use crate::logging::TRACE_TARGET;
use crate::rate_limiter::RateLimiter;
use crate::stats::ExecutorStats;

// ============================================================
// STATE MACHINE
// ============================================================

/// Processor lifecycle: `IDLE -> RUNNING <-> DRAINING -> STOPPED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessorState::Running,
            2 => ProcessorState::Draining,
            3 => ProcessorState::Stopped,
            _ => ProcessorState::Idle,
        }
    }
}

// ============================================================
// PROCESSOR
// ============================================================

/// Consumes events from a bounded queue, enforces admission, and spawns
/// concurrent invocations.
pub struct Processor<E: Event> {
    queue_capacity: usize,
    capacity_refresh_time: Duration,
    interval: Duration,

    tx: mpsc::Sender<E>,
    rx: Mutex<mpsc::Receiver<E>>,
    /// Queued events, the holdback slot included.
    queued: AtomicUsize,
    /// A denied head waiting to be re-examined before newer events.
    holdback: Mutex<Option<E>>,

    /// Remaining examinations in the current cycle.
    available_capacity: AtomicUsize,
    concurrency_limit: usize,
    concurrency: Arc<Semaphore>,

    limiter: Option<Arc<RateLimiter>>,
    stats: Arc<ExecutorStats>,

    state: AtomicU8,
    stop_requested: AtomicBool,
    replenisher: Mutex<Option<JoinHandle<()>>>,
    execute_task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Event> Processor<E> {
    /// Build a processor from a validated configuration.
    pub fn new(
        config: &ExecutorConfig,
        limiter: Option<Arc<RateLimiter>>,
        stats: Arc<ExecutorStats>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Ok(Arc::new(Self {
            queue_capacity: config.queue_capacity,
            capacity_refresh_time: config.refresh_time(),
            interval: config.effective_interval(),
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            holdback: Mutex::new(None),
            available_capacity: AtomicUsize::new(config.queue_capacity),
            concurrency_limit: config.concurrency(),
            concurrency: Arc::new(Semaphore::new(config.concurrency())),
            limiter,
            stats,
            state: AtomicU8::new(ProcessorState::Idle as u8),
            stop_requested: AtomicBool::new(false),
            replenisher: Mutex::new(None),
            execute_task: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Queued events, the holdback slot included.
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Current per-cycle budget.
    pub fn available_capacity(&self) -> usize {
        self.available_capacity.load(Ordering::SeqCst)
    }

    /// Invocations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.concurrency_limit - self.concurrency.available_permits()
    }

    /// Add an event to the queue, suspending while the queue is full.
    pub async fn enqueue(&self, event: E) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).await.is_err() {
            // receiver lives as long as self; only reachable mid-teardown
            self.queued.fetch_sub(1, Ordering::SeqCst);
            error!(target: TRACE_TARGET, "enqueue on a torn-down processor");
        }
    }

    /// Start processing: clears the stop signal, spawns the execute loop
    /// and (with a limiter attached) the replenisher task.
    pub async fn start(self: &Arc<Self>) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_state(ProcessorState::Running);

        if self.limiter.is_some() {
            let mut replenisher = self.replenisher.lock().await;
            if replenisher.is_none() {
                let this = Arc::clone(self);
                *replenisher = Some(tokio::spawn(async move {
                    this.replenish_loop().await;
                }));
            }
        }

        let mut execute_task = self.execute_task.lock().await;
        if execute_task.is_none() {
            let this = Arc::clone(self);
            *execute_task = Some(tokio::spawn(async move {
                this.execute().await;
            }));
        }
    }

    /// Request a stop: no new dequeues, in-flight tasks run to
    /// completion, the replenisher is cancelled and awaited.
    pub async fn stop(&self) {
        if self.state() == ProcessorState::Stopped {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.set_state(ProcessorState::Draining);

        if let Some(handle) = self.replenisher.lock().await.take() {
            handle.abort();
            // cancellation is swallowed
            let _ = handle.await;
            info!(target: TRACE_TARGET, "rate limit replenisher task cancelled");
        }

        if let Some(handle) = self.execute_task.lock().await.take() {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(target: TRACE_TARGET, %err, "execute loop panicked");
                }
            }
        }
        self.set_state(ProcessorState::Stopped);
    }

    /// Run `process()` every `capacity_refresh_time` until stopped.
    pub async fn execute(&self) {
        while !self.is_stopped() {
            self.process().await;
            tokio::time::sleep(self.capacity_refresh_time).await;
        }
    }

    /// One processing cycle.
    ///
    /// Examines up to `available_capacity` events: a statically
    /// over-budget event fails fast, an admitted event is dispatched, a
    /// denied event goes to the holdback slot and is re-examined after
    /// `capacity_refresh_time`. Afterwards the in-flight set is awaited
    /// and the budget reset.
    pub async fn process(&self) {
        let mut rx = self.rx.lock().await;
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if self.available_capacity.load(Ordering::SeqCst) == 0 {
                break;
            }

            let event = {
                let mut holdback = self.holdback.lock().await;
                match holdback.take() {
                    Some(event) => Some(event),
                    None => rx.try_recv().ok(),
                }
            };
            let Some(event) = event else { break };

            // a request that can never fit the budget would spin forever
            if let Some(limiter) = &self.limiter {
                if let Some((requested_tokens, limit_tokens)) =
                    limiter.exceeds_budget(&event.request())
                {
                    event.fail(format!(
                        "request of {requested_tokens} tokens exceeds the token budget of {limit_tokens}"
                    ));
                    self.stats.incr_failed();
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.available_capacity.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            }

            if self.request_permission(&event) {
                if event.transition(EventStatus::Processing).is_ok() {
                    // the permit is held before the queue count drops, so
                    // join() never observes a gap
                    self.dispatch(event, &mut tasks).await;
                } else {
                    // reached a terminal status while queued; nothing to run
                    debug!(target: TRACE_TARGET, id = %event.id(), "skipping terminal event");
                }
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.available_capacity.fetch_sub(1, Ordering::SeqCst);
            } else {
                self.stats.incr_admission_denied();
                *self.holdback.lock().await = Some(event);
                self.available_capacity.fetch_sub(1, Ordering::SeqCst);
                // head-of-line: wait a refresh, then re-examine the same event
                tokio::time::sleep(self.capacity_refresh_time).await;
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!(target: TRACE_TARGET, %err, "invocation task panicked");
                }
            }
        }
        self.available_capacity
            .store(self.queue_capacity, Ordering::SeqCst);
    }

    async fn dispatch(&self, event: E, tasks: &mut JoinSet<()>) {
        let permit = Arc::clone(&self.concurrency)
            .acquire_owned()
            .await
            .expect("concurrency semaphore is never closed");
        self.stats.incr_dispatched();
        let stats = Arc::clone(&self.stats);
        tasks.spawn(async move {
            let _permit = permit;
            event.invoke().await;
            match event.status() {
                EventStatus::Completed => stats.incr_completed(),
                EventStatus::Failed => stats.incr_failed(),
                status => {
                    warn!(target: TRACE_TARGET, id = %event.id(), ?status, "invoke returned without a terminal status")
                }
            }
        });
    }

    /// The admission predicate: without a limiter everything passes;
    /// with one, expired holds are released and capacity reserved in one
    /// atomic step.
    fn request_permission(&self, event: &E) -> bool {
        match &self.limiter {
            None => true,
            Some(limiter) => limiter.try_acquire(&event.request(), Utc::now()),
        }
    }

    async fn replenish_loop(&self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if self.is_stopped() {
                break;
            }
            if let Some(limiter) = &self.limiter {
                let queued = self.queue_len();
                limiter.replenish(queued);
                debug!(target: TRACE_TARGET, queued, "rate limit capacities replenished");
            }
        }
        info!(target: TRACE_TARGET, "replenisher exited");
    }

    /// Wait until the queue is empty and nothing is in flight.
    pub async fn join(&self) {
        loop {
            if self.queue_len() == 0 && self.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
