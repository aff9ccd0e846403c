// SPDX-License-Identifier: MIT
//! Cooperative backpressure on the workload loop.
//!
//! The coordinator engages it when telemetry falls behind; the workload
//! thread checks it between units, pauses, and drops its own scheduling
//! priority until telemetry has caught up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const PAUSE_SLICE: Duration = Duration::from_millis(2);
/// Nice increment applied while throttled.
const THROTTLED_NICE: libc::c_int = 10;

#[derive(Debug, Default)]
pub struct Backpressure {
    engaged: AtomicBool,
    engagements: AtomicU64,
}

impl Backpressure {
    /// Returns `true` if this call changed the state.
    pub fn engage(&self) -> bool {
        let changed = !self.engaged.swap(true, Ordering::AcqRel);
        if changed {
            self.engagements.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    /// Returns `true` if this call changed the state.
    pub fn release(&self) -> bool {
        self.engaged.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// How many times backpressure has been engaged.
    #[must_use]
    pub fn engagements(&self) -> u64 {
        self.engagements.load(Ordering::Relaxed)
    }
}

/// Per-thread side of [`Backpressure`]. Owned by the workload loop.
pub struct Yielder {
    original_nice: Option<libc::c_int>,
}

impl Yielder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            original_nice: None,
        }
    }

    /// Blocks while `backpressure` is engaged and `stop` is clear. Returns
    /// `true` if it had to wait.
    pub fn throttle(&mut self, backpressure: &Backpressure, stop: &AtomicBool) -> bool {
        if !backpressure.is_engaged() {
            self.restore();
            return false;
        }

        self.lower();
        while backpressure.is_engaged() && !stop.load(Ordering::Acquire) {
            thread::sleep(PAUSE_SLICE);
        }
        self.restore();
        true
    }

    fn lower(&mut self) {
        if self.original_nice.is_some() {
            return;
        }
        let current = thread_nice();
        let target = current.saturating_add(THROTTLED_NICE).min(19);
        match set_thread_nice(target) {
            Ok(()) => {
                log::debug!("workload thread niced from {current} to {target}");
                self.original_nice = Some(current);
            }
            Err(e) => log::debug!("could not lower workload priority: {e}"),
        }
    }

    fn restore(&mut self) {
        let Some(nice) = self.original_nice.take() else {
            return;
        };
        // Raising priority back needs CAP_SYS_NICE on most systems.
        if let Err(e) = set_thread_nice(nice) {
            log::warn!("workload thread stays at lowered priority: {e}");
        }
    }
}

impl Default for Yielder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Yielder {
    fn drop(&mut self) {
        self.restore();
    }
}

fn current_tid() -> libc::id_t {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    libc::id_t::try_from(tid).unwrap_or(0)
}

fn thread_nice() -> libc::c_int {
    // SAFETY: plain syscall on the calling thread's id.
    unsafe { libc::getpriority(libc::PRIO_PROCESS, current_tid()) }
}

fn set_thread_nice(nice: libc::c_int) -> std::io::Result<()> {
    // SAFETY: plain syscall on the calling thread's id.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, current_tid(), nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn engage_and_release_report_changes() {
        let bp = Backpressure::default();
        assert!(bp.engage());
        assert!(!bp.engage());
        assert!(bp.is_engaged());
        assert!(bp.release());
        assert!(!bp.release());
        assert!(bp.engage());
        assert_eq!(bp.engagements(), 2);
    }

    #[test]
    fn released_backpressure_does_not_block() {
        let bp = Backpressure::default();
        let stop = AtomicBool::new(false);
        let mut yielder = Yielder::new();
        assert!(!yielder.throttle(&bp, &stop));
    }

    #[test]
    fn throttle_waits_until_release() {
        let bp = Arc::new(Backpressure::default());
        bp.engage();
        let releaser = {
            let bp = Arc::clone(&bp);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                bp.release();
            })
        };

        let stop = AtomicBool::new(false);
        let started = Instant::now();
        let waited = thread::spawn(move || Yielder::new().throttle(&bp, &stop))
            .join()
            .unwrap();
        assert!(waited);
        assert!(started.elapsed() >= Duration::from_millis(30));
        releaser.join().unwrap();
    }

    #[test]
    fn stop_breaks_the_pause() {
        let bp = Backpressure::default();
        bp.engage();
        let stop = AtomicBool::new(true);
        assert!(Yielder::new().throttle(&bp, &stop));
    }
}
