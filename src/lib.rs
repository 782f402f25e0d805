//! flowgate - Rate-gated asynchronous action executor
//!
//! The concurrency kernel under an LLM-orchestration stack: API-call
//! events enter a bounded queue, a replenisher refills request/token
//! budgets on a wall-clock interval, a processor dispatches events only
//! when the admission predicate holds, each invocation runs under a
//! retry policy honoring provider signals, and every event stays
//! addressable through an ordered, id-keyed store.
//!
//! # Modules
//!
//! - [`id`] - Opaque unique identifiers (UUID v4)
//! - [`element`] - Identity base for stored entities
//! - [`ordered_index`] - Duplicate-free id sequences
//! - [`pile`] - Ordered, id-keyed, task-safe element store
//! - [`event`] - Event lifecycle and status machine
//! - [`api_call`] - API-call events and the transport seam
//! - [`rate_limiter`] - Request/token budget accounting
//! - [`retry`] - Backoff retry wrapper
//! - [`processor`] - Capacity-gated event dispatch
//! - [`executor`] - The public entry point for enqueueing work
//! - [`journal`] - Append-only event record sink
//! - [`stats`] - Execution statistics
//! - [`config`] - Configuration records and loaders
//! - [`logging`] - Tracing initialization

// Foundations - must be first!
pub mod error;
pub mod id;

// Configuration
pub mod config;

// Core components
pub mod api_call;
pub mod element;
pub mod event;
pub mod executor;
pub mod journal;
pub mod ordered_index;
pub mod pile;
pub mod processor;
pub mod rate_limiter;
pub mod retry;
pub mod stats;

// Operational glue
pub mod logging;

#[cfg(feature = "mock-transport")]
pub mod mock;

// Convenient re-exports at crate root
pub use api_call::{ApiCall, ApiCallEvent, CallResponse, HeuristicTokenCounter, TokenCounter};
pub use config::{AppConfig, ExecutorConfig, JournalConfig, JournalFormat, RetryConfig};
pub use element::{Element, ElementMeta};
pub use error::{CallError, ConfigError, EventError, PileError};
pub use event::{AdmissionRequest, Event, EventStatus, Execution};
pub use executor::Executor;
pub use id::Id;
pub use journal::{Journal, JournalRecord};
pub use ordered_index::OrderedIndex;
pub use pile::{Pile, RawPile};
pub use processor::{Processor, ProcessorState};
pub use rate_limiter::RateLimiter;
pub use stats::{ExecutorStats, ExecutorStatsSnapshot};
