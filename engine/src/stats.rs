use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters. Updated with relaxed atomics; read through
/// [`EngineStats::snapshot`].
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub(crate) tasks_submitted: AtomicU64,
    pub(crate) tasks_succeeded: AtomicU64,
    pub(crate) tasks_failed: AtomicU64,
    pub(crate) tasks_dropped: AtomicU64,
    pub(crate) calls_started: AtomicU64,
    pub(crate) calls_resolved: AtomicU64,
    pub(crate) calls_rejected: AtomicU64,
    pub(crate) calls_timed_out: AtomicU64,
    pub(crate) calls_cancelled: AtomicU64,
    pub(crate) calls_abandoned: AtomicU64,
    pub(crate) duplicate_completions: AtomicU64,
    pub(crate) never_issued_completions: AtomicU64,
    pub(crate) late_completions: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    pub(crate) fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(u64::try_from(amount).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            tasks_submitted: read(&self.tasks_submitted),
            tasks_succeeded: read(&self.tasks_succeeded),
            tasks_failed: read(&self.tasks_failed),
            tasks_dropped: read(&self.tasks_dropped),
            calls_started: read(&self.calls_started),
            calls_resolved: read(&self.calls_resolved),
            calls_rejected: read(&self.calls_rejected),
            calls_timed_out: read(&self.calls_timed_out),
            calls_cancelled: read(&self.calls_cancelled),
            calls_abandoned: read(&self.calls_abandoned),
            duplicate_completions: read(&self.duplicate_completions),
            never_issued_completions: read(&self.never_issued_completions),
            late_completions: read(&self.late_completions),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Tasks discarded because the engine was shutting down.
    pub tasks_dropped: u64,
    pub calls_started: u64,
    pub calls_resolved: u64,
    pub calls_rejected: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    pub calls_abandoned: u64,
    /// Host completions for ids that had already settled.
    pub duplicate_completions: u64,
    /// Host completions for ids this engine never issued.
    pub never_issued_completions: u64,
    /// Host completions arriving after a timeout or cancellation.
    pub late_completions: u64,
}

impl StatsSnapshot {
    /// All completions that matched no waiting call.
    #[must_use]
    pub fn unmatched_completions(&self) -> u64 {
        self.duplicate_completions + self.never_issued_completions + self.late_completions
    }
}
