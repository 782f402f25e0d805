//! Executor - the public entry point for enqueueing work.
//!
//! An executor owns:
//!
//! - a [`Pile`] holding every event it has ever accepted (until popped)
//! - an [`OrderedIndex`] of events appended but not yet forwarded
//! - a lazily constructed [`Processor`] doing the actual dispatch
//!
//! `append` stores an event and marks it pending; `forward` drains the
//! pending index into the processor's queue and runs one processing
//! cycle. The pending/completed/failed views are computed projections
//! over the pile, not materialized storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::ExecutorConfig;
use crate::element::Element;
use crate::error::ConfigError;
use crate::event::{Event, EventStatus};
use crate::id::Id;
use crate::logging::TRACE_TARGET;
use crate::ordered_index::OrderedIndex;
use crate::pile::{Pile, RawPile};
use crate::processor::{Processor, ProcessorState};
use crate::rate_limiter::RateLimiter;
use crate::stats::{ExecutorStats, ExecutorStatsSnapshot};

/// Owns a pile of events and a processor; see the module docs.
pub struct Executor<E: Event> {
    config: ExecutorConfig,
    pile: Pile<E>,
    pending: Mutex<OrderedIndex>,
    processor: Mutex<Option<Arc<Processor<E>>>>,
    limiter: Option<Arc<RateLimiter>>,
    stats: Arc<ExecutorStats>,
}

impl<E: Event> Executor<E> {
    /// Build an executor. The rate limiter exists from construction (so
    /// events can be built against it); the processor is constructed
    /// lazily on first use.
    pub fn new(config: ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = if config.limit_requests.is_some() || config.limit_tokens.is_some() {
            Some(Arc::new(RateLimiter::from_config(&config)?))
        } else {
            None
        };
        Ok(Self {
            config,
            pile: Pile::new(),
            pending: Mutex::new(OrderedIndex::new()),
            processor: Mutex::new(None),
            limiter,
            stats: Arc::new(ExecutorStats::new()),
        })
    }

    /// The shared limiter, when either budget axis is configured.
    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The event store. Retains every appended event until popped.
    pub fn pile(&self) -> &Pile<E> {
        &self.pile
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Accept an event: into the pile, and into the pending index.
    pub async fn append(&self, event: E) {
        let id = event.id();
        if !self.pile.include(event).await {
            return; // already known
        }
        self.pending.lock().await.append(id);
        self.stats.incr_appended();
    }

    async fn ensure_processor(&self) -> Result<Arc<Processor<E>>, ConfigError> {
        let mut guard = self.processor.lock().await;
        if let Some(processor) = guard.as_ref() {
            return Ok(Arc::clone(processor));
        }
        let processor = Processor::new(
            &self.config,
            self.limiter.clone(),
            Arc::clone(&self.stats),
        )?;
        *guard = Some(Arc::clone(&processor));
        Ok(processor)
    }

    /// Start (lazily constructing) the processor and its background
    /// tasks.
    pub async fn start(&self) -> Result<(), ConfigError> {
        let processor = self.ensure_processor().await?;
        processor.start().await;
        Ok(())
    }

    /// Stop dispatch. In-flight invocations run to completion.
    pub async fn stop(&self) {
        let processor = self.processor.lock().await.clone();
        if let Some(processor) = processor {
            processor.stop().await;
            info!(target: TRACE_TARGET, "executor stopped");
        }
    }

    pub async fn processor_state(&self) -> Option<ProcessorState> {
        self.processor.lock().await.as_ref().map(|p| p.state())
    }

    /// Drain the pending index into the processor queue and run one
    /// processing cycle. A no-op when nothing is pending.
    ///
    /// Does not start the background loops; a stopped processor stays
    /// stopped. When more events are pending than the queue holds, the
    /// executor must be started so the execute loop can drain the
    /// overflow.
    pub async fn forward(&self) -> Result<(), ConfigError> {
        let processor = self.ensure_processor().await?;
        let drained = self.pending.lock().await.drain();
        for id in drained {
            if let Some(event) = self.pile.get(&id).await {
                processor.enqueue(event).await;
            }
        }
        processor.process().await;
        Ok(())
    }

    /// Forward pending work and wait (bounded) until the queue is empty
    /// and nothing is in flight. Returns whether quiescence was reached.
    pub async fn drain(&self, timeout: Duration) -> Result<bool, ConfigError> {
        self.forward().await?;
        let processor = self.ensure_processor().await?;
        Ok(tokio::time::timeout(timeout, processor.join()).await.is_ok())
    }

    pub async fn contains(&self, id: &Id) -> bool {
        self.pile.contains(id).await
    }

    pub async fn len(&self) -> usize {
        self.pile.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.pile.is_empty().await
    }

    async fn project(&self, status: EventStatus) -> Pile<E> {
        let raw = self.pile.read().await;
        let filtered: RawPile<E> = raw
            .values()
            .filter(|event| event.status() == status)
            .cloned()
            .collect();
        Pile::from_raw(filtered)
    }

    /// Events still waiting for dispatch or admission.
    pub async fn pending_events(&self) -> Pile<E> {
        self.project(EventStatus::Pending).await
    }

    /// Events whose invocation succeeded.
    pub async fn completed_events(&self) -> Pile<E> {
        self.project(EventStatus::Completed).await
    }

    /// Events whose invocation failed or was rejected.
    pub async fn failed_events(&self) -> Pile<E> {
        self.project(EventStatus::Failed).await
    }
}
