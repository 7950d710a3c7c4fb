//! Process-local delivery counters.

use parking_lot::Mutex;
use serde::Serialize;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub enqueued: u64,
    pub dead_lettered: u64,
}

impl StatsSnapshot {
    /// Deliveries that reached a terminal outcome.
    pub fn terminal(&self) -> u64 {
        self.sent + self.failed
    }
}

/// Monotonic counters shared by the producer and the task processor.
///
/// Guarded by one lock of their own. Requeues never touch them.
#[derive(Default)]
pub struct Stats {
    counters: Mutex<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.counters.lock().sent += 1;
    }

    pub fn record_failed(&self) {
        self.counters.lock().failed += 1;
    }

    /// A task hit the opt-in requeue cap and was dead-lettered. Counts as a
    /// terminal failure. Never called under the default uncapped policy.
    pub fn record_dead_lettered(&self) {
        let mut counters = self.counters.lock();
        counters.failed += 1;
        counters.dead_lettered += 1;
    }

    pub fn record_enqueued(&self, count: u64) {
        self.counters.lock().enqueued += count;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.counters.lock()
    }
}
