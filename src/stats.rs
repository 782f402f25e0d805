//! Execution statistics.
//!
//! Atomic cumulative counters shared by the executor and its processor,
//! with an immutable snapshot type for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one executor.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Events accepted into the pile.
    pub appended: AtomicU64,
    /// Events handed to an invocation task.
    pub dispatched: AtomicU64,
    /// Events that reached COMPLETED.
    pub completed: AtomicU64,
    /// Events that reached FAILED.
    pub failed: AtomicU64,
    /// Admission checks that came back negative.
    pub admission_denied: AtomicU64,
}

impl ExecutorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_appended(&self) {
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_admission_denied(&self) {
        self.admission_denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current counters.
    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            admission_denied: self.admission_denied.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of stats (for reporting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub appended: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub admission_denied: u64,
}

impl std::fmt::Display for ExecutorStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executor Stats: appended={}, dispatched={}, completed={}, failed={}, admission_denied={}",
            self.appended, self.dispatched, self.completed, self.failed, self.admission_denied
        )
    }
}
