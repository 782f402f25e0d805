//! Event lifecycle and status machine.
//!
//! An event is an addressable unit of work wrapping a single upstream
//! call. Its status walks a DAG with no backward edges:
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ COMPLETED
//!                      └────▶ FAILED
//! ```
//!
//! Once terminal, an event is immutable with respect to status and
//! execution. An event must not be invoked more than once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::EventError;

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the status DAG.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::Pending, EventStatus::Processing)
                | (EventStatus::Processing, EventStatus::Completed)
                | (EventStatus::Processing, EventStatus::Failed)
                // an event can be failed before dispatch (e.g. over budget)
                | (EventStatus::Pending, EventStatus::Failed)
        )
    }

    /// Validate the edge, returning the new status.
    pub fn transition_to(&self, next: EventStatus) -> Result<EventStatus, EventError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EventError {
                from: *self,
                to: next,
            })
        }
    }
}

/// Outcome record of an event's single invocation.
///
/// `response` is set iff the event completed; `error` is set iff it
/// failed; `duration` is set for both terminal statuses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Wall-clock seconds spent inside `invoke`, retries included.
    pub duration: Option<f64>,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// The admission-relevant snapshot of an event's request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Token cost of the request body itself.
    pub required_tokens: u64,
    /// Upper estimate of the completion the upstream will produce.
    pub estimated_output_tokens: u64,
}

impl AdmissionRequest {
    pub fn total(&self) -> u64 {
        self.required_tokens + self.estimated_output_tokens
    }
}

/// An element with a status lifecycle and a one-shot asynchronous action.
///
/// Implementations are shared handles: cloning shares status and
/// execution state, so the pile, the processor and the in-flight task all
/// observe the same lifecycle.
#[async_trait]
pub trait Event: Element + Clone + Send + Sync + 'static {
    fn status(&self) -> EventStatus;

    /// Apply a status transition; illegal edges are rejected.
    fn transition(&self, next: EventStatus) -> Result<(), EventError>;

    /// Snapshot used by the admission predicate.
    fn request(&self) -> AdmissionRequest;

    fn execution(&self) -> Execution;

    /// Run the wrapped action, moving the event to a terminal status and
    /// populating the execution record. Never called twice.
    async fn invoke(&self);

    /// Fail the event before dispatch with a terminal error summary.
    fn fail(&self, error: String);
}
