//! Optional scheduler counters, compiled in with the `metrics` feature.
//!
//! Counters are process-wide relaxed atomics; sampling them is racy by
//! nature and intended for throughput analysis, not for synchronisation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler-wide event counters.
#[derive(Debug)]
pub struct Metrics {
    /// Job bodies run to completion.
    pub jobs_executed: AtomicU64,
    /// Task coroutine resumptions (including the first entry).
    pub tasks_resumed: AtomicU64,
    /// Pushes routed to a specific worker's inbox.
    pub local_pushes: AtomicU64,
    /// Pushes routed to the central queue.
    pub central_pushes: AtomicU64,
    /// Job allocations served from the recycler.
    pub recycler_hits: AtomicU64,
    /// Job allocations that fell through to the memory resource.
    pub recycler_misses: AtomicU64,
}

static METRICS: Metrics = Metrics {
    jobs_executed: AtomicU64::new(0),
    tasks_resumed: AtomicU64::new(0),
    local_pushes: AtomicU64::new(0),
    central_pushes: AtomicU64::new(0),
    recycler_hits: AtomicU64::new(0),
    recycler_misses: AtomicU64::new(0),
};

/// The process-wide counters.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

impl Metrics {
    /// Zeroes every counter; useful between benchmark phases.
    pub fn reset(&self) {
        self.jobs_executed.store(0, Ordering::Relaxed);
        self.tasks_resumed.store(0, Ordering::Relaxed);
        self.local_pushes.store(0, Ordering::Relaxed);
        self.central_pushes.store(0, Ordering::Relaxed);
        self.recycler_hits.store(0, Ordering::Relaxed);
        self.recycler_misses.store(0, Ordering::Relaxed);
    }
}
