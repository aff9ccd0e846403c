// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{UnitStatus, WorkloadEvent};

/// Lock-free throughput counters, written only by the workload loop.
#[derive(Debug, Default)]
pub struct ThroughputCounters {
    iterations: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    busy_ns: AtomicU64,
    last_completion_ns: AtomicU64,
    consecutive_failures: AtomicU32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThroughputSnapshot {
    pub iterations: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub busy_ns: u64,
    /// Session-clock time of the newest completed unit, 0 if none yet.
    pub last_completion_ns: u64,
    pub consecutive_failures: u32,
}

impl ThroughputCounters {
    pub fn record(&self, event: &WorkloadEvent, consecutive_failures: u32) {
        match event.status {
            UnitStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.busy_ns.fetch_add(event.duration_ns, Ordering::Relaxed);
                self.last_completion_ns
                    .fetch_max(event.timestamp_ns, Ordering::Relaxed);
            }
            UnitStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.busy_ns.fetch_add(event.duration_ns, Ordering::Relaxed);
            }
            UnitStatus::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.consecutive_failures
            .store(consecutive_failures, Ordering::Relaxed);
        // Published last so a reader that sees the new count sees the rest.
        self.iterations.fetch_add(1, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> ThroughputSnapshot {
        let iterations = self.iterations.load(Ordering::Acquire);
        ThroughputSnapshot {
            iterations,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            busy_ns: self.busy_ns.load(Ordering::Relaxed),
            last_completion_ns: self.last_completion_ns.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

impl ThroughputSnapshot {
    #[must_use]
    pub fn iterations_per_sec(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let n = self.iterations as f64;
            n / secs
        } else {
            0.0
        }
    }

    #[must_use]
    pub fn cumulative_busy(&self) -> Duration {
        Duration::from_nanos(self.busy_ns)
    }
}
