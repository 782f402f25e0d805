//! Element identity base.
//!
//! Everything stored in a [`Pile`](crate::pile::Pile) is an element: it
//! owns an immutable [`Id`] minted at construction and a creation
//! timestamp. Equality between elements is equality of ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Identity fields shared by every stored entity.
///
/// `created_at` is wall-clock and monotonic within a process only to the
/// resolution of the system clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementMeta {
    pub id: Id,
    pub created_at: DateTime<Utc>,
}

impl ElementMeta {
    pub fn new() -> Self {
        Self {
            id: Id::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for ElementMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A uniquely identifiable, timestamped entity.
pub trait Element {
    fn id(&self) -> Id;
    fn created_at(&self) -> DateTime<Utc>;
}

impl Element for ElementMeta {
    fn id(&self) -> Id {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
